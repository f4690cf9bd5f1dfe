use crate::error::Error;
use crate::forms::FieldErrors;
use crate::model::*;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{abort, ConflictableTransactionError, Transactional};
use std::convert::TryInto;

// Big-endian so that tree order follows id order, which is insertion order.
fn serialize_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn deserialize_id<V: AsRef<[u8]>>(id: V) -> Result<u64, Error> {
    id.as_ref()
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| Error::Corrupt("id"))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    Ok(bincode::deserialize(bytes)?)
}

fn email_key(email: &str) -> Vec<u8> {
    email.trim().to_lowercase().into_bytes()
}

fn now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

const USERS: &[u8] = b"users";
const USERS_EMAIL: &[u8] = b"users_email";
const FILMS: &[u8] = b"films";
const FILMS_DESCRIPTION: &[u8] = b"films_description";
const FILMS_CODE: &[u8] = b"films_code";
const COLLECTIONS: &[u8] = b"collections";
const SESSIONS: &[u8] = b"sessions";

pub trait UserDb {
    type Error;
    fn add_user(&self, user: &User) -> Result<u64, Self::Error>;
    fn get_user(&self, id: u64) -> Result<Option<User>, Self::Error>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<(u64, User)>, Self::Error>;
    fn update_user(&self, id: u64, details: &AccountDetails) -> Result<User, Self::Error>;
    /// Removes the user together with their collection and, if given, the
    /// session they are deleting from, in one transaction.
    fn delete_user(&self, id: u64, session: Option<&str>) -> Result<(), Self::Error>;
    fn count_users(&self) -> Result<usize, Self::Error>;
}

impl UserDb for sled::Db {
    type Error = Error;

    fn add_user(&self, user: &User) -> Result<u64, Error> {
        let users = self.open_tree(USERS)?;
        let users_email = self.open_tree(USERS_EMAIL)?;
        let id = self.generate_id()?;
        let value = encode(user)?;
        let email = email_key(&user.email);
        (&users, &users_email).transaction(|(users, users_email)| {
            if users_email
                .insert(email.as_slice(), &serialize_id(id))?
                .is_some()
            {
                return abort(Error::taken("email"));
            }
            users.insert(&serialize_id(id), value.as_slice())?;
            Ok(())
        })?;
        Ok(id)
    }

    fn get_user(&self, id: u64) -> Result<Option<User>, Error> {
        let users = self.open_tree(USERS)?;
        users
            .get(serialize_id(id))?
            .map(|value| decode(&value))
            .transpose()
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<(u64, User)>, Error> {
        let users_email = self.open_tree(USERS_EMAIL)?;
        let users = self.open_tree(USERS)?;
        if let Some(id) = users_email.get(email_key(email))? {
            let value = users.get(&id)?.ok_or(Error::Corrupt("users_email"))?;
            Ok(Some((deserialize_id(id)?, decode(&value)?)))
        } else {
            Ok(None)
        }
    }

    fn update_user(&self, id: u64, details: &AccountDetails) -> Result<User, Error> {
        let users = self.open_tree(USERS)?;
        let users_email = self.open_tree(USERS_EMAIL)?;
        let key = serialize_id(id);
        let user = (&users, &users_email).transaction(|(users, users_email)| {
            let mut user: User = match users.get(&key)? {
                Some(value) => decode(&value).map_err(ConflictableTransactionError::Abort)?,
                None => return abort(Error::NotFound("user")),
            };
            let old_email = email_key(&user.email);
            let new_email = email_key(&details.email);
            if old_email != new_email {
                if users_email.get(new_email.as_slice())?.is_some() {
                    return abort(Error::taken("email"));
                }
                users_email.remove(old_email.as_slice())?;
                users_email.insert(new_email.as_slice(), &key)?;
            }
            user.first_name = details.first_name.clone();
            user.last_name = details.last_name.clone();
            user.email = details.email.clone();
            let value = encode(&user).map_err(ConflictableTransactionError::Abort)?;
            users.insert(&key, value)?;
            Ok(user)
        })?;
        Ok(user)
    }

    fn delete_user(&self, id: u64, session: Option<&str>) -> Result<(), Error> {
        let users = self.open_tree(USERS)?;
        let users_email = self.open_tree(USERS_EMAIL)?;
        let collections = self.open_tree(COLLECTIONS)?;
        let sessions = self.open_tree(SESSIONS)?;
        let key = serialize_id(id);
        (&users, &users_email, &collections, &sessions).transaction(
            |(users, users_email, collections, sessions)| {
                let user: User = match users.remove(&key)? {
                    Some(value) => decode(&value).map_err(ConflictableTransactionError::Abort)?,
                    None => return abort(Error::NotFound("user")),
                };
                users_email.remove(email_key(&user.email))?;
                collections.remove(&key)?;
                if let Some(token) = session {
                    sessions.remove(token.as_bytes())?;
                }
                Ok(())
            },
        )?;
        self.delete_user_sessions(id)?;
        Ok(())
    }

    fn count_users(&self) -> Result<usize, Error> {
        Ok(self.open_tree(USERS)?.len())
    }
}

pub trait FilmDb {
    type Error;
    fn add_film(&self, film: &Film) -> Result<u64, Self::Error>;
    fn get_film(&self, id: u64) -> Result<Option<Film>, Self::Error>;
    fn update_film(&self, id: u64, film: &Film) -> Result<(), Self::Error>;
    fn list_films(&self) -> Result<Vec<(u64, Film)>, Self::Error>;
}

impl FilmDb for sled::Db {
    type Error = Error;

    fn add_film(&self, film: &Film) -> Result<u64, Error> {
        let films = self.open_tree(FILMS)?;
        let films_description = self.open_tree(FILMS_DESCRIPTION)?;
        let films_code = self.open_tree(FILMS_CODE)?;
        let id = self.generate_id()?;
        let value = encode(film)?;
        let code = film.code.to_be_bytes();
        (&films, &films_description, &films_code).transaction(
            |(films, films_description, films_code)| {
                let mut taken = FieldErrors::default();
                if films_description
                    .get(film.description.as_bytes())?
                    .is_some()
                {
                    taken.add("description", "Another film already has this description.");
                }
                if films_code.get(&code)?.is_some() {
                    taken.add("code", "Another film already has this code.");
                }
                if !taken.is_empty() {
                    return abort(Error::Validation(taken));
                }
                films_description.insert(film.description.as_bytes(), &serialize_id(id))?;
                films_code.insert(&code, &serialize_id(id))?;
                films.insert(&serialize_id(id), value.as_slice())?;
                Ok(())
            },
        )?;
        Ok(id)
    }

    fn get_film(&self, id: u64) -> Result<Option<Film>, Error> {
        let films = self.open_tree(FILMS)?;
        films
            .get(serialize_id(id))?
            .map(|value| decode(&value))
            .transpose()
    }

    fn update_film(&self, id: u64, film: &Film) -> Result<(), Error> {
        let films = self.open_tree(FILMS)?;
        let films_description = self.open_tree(FILMS_DESCRIPTION)?;
        let films_code = self.open_tree(FILMS_CODE)?;
        let key = serialize_id(id);
        let value = encode(film)?;
        let code = film.code.to_be_bytes();
        (&films, &films_description, &films_code).transaction(
            |(films, films_description, films_code)| {
                let old: Film = match films.get(&key)? {
                    Some(value) => decode(&value).map_err(ConflictableTransactionError::Abort)?,
                    None => return abort(Error::NotFound("film")),
                };
                let description_changed = old.description != film.description;
                let code_changed = old.code != film.code;

                let mut taken = FieldErrors::default();
                if description_changed
                    && films_description
                        .get(film.description.as_bytes())?
                        .is_some()
                {
                    taken.add("description", "Another film already has this description.");
                }
                if code_changed && films_code.get(&code)?.is_some() {
                    taken.add("code", "Another film already has this code.");
                }
                if !taken.is_empty() {
                    return abort(Error::Validation(taken));
                }

                if description_changed {
                    films_description.remove(old.description.as_bytes())?;
                    films_description.insert(film.description.as_bytes(), &key)?;
                }
                if code_changed {
                    films_code.remove(&old.code.to_be_bytes())?;
                    films_code.insert(&code, &key)?;
                }
                films.insert(&key, value.as_slice())?;
                Ok(())
            },
        )?;
        Ok(())
    }

    fn list_films(&self) -> Result<Vec<(u64, Film)>, Error> {
        let films = self.open_tree(FILMS)?;
        films
            .iter()
            .map(|entry| -> Result<(u64, Film), Error> {
                let (id, value) = entry?;
                Ok((deserialize_id(id)?, decode(&value)?))
            })
            .collect()
    }
}

pub trait CollectionDb {
    type Error;
    /// Adds the film to the user's collection. A film already present keeps a
    /// single entry and only has its own status updated.
    fn add_to_collection(
        &self,
        user_id: u64,
        film_id: u64,
        own: OwnStatus,
    ) -> Result<CollectionEntry, Self::Error>;
    fn list_collection(&self, user_id: u64) -> Result<Vec<(CollectionEntry, Film)>, Self::Error>;
    /// Returns how many entries were removed; zero is not an error.
    fn remove_from_collection(&self, user_id: u64, film_id: u64) -> Result<usize, Self::Error>;
}

impl CollectionDb for sled::Db {
    type Error = Error;

    fn add_to_collection(
        &self,
        user_id: u64,
        film_id: u64,
        own: OwnStatus,
    ) -> Result<CollectionEntry, Error> {
        let users = self.open_tree(USERS)?;
        let films = self.open_tree(FILMS)?;
        let collections = self.open_tree(COLLECTIONS)?;
        let user_key = serialize_id(user_id);
        let film_key = serialize_id(film_id);
        let entry = CollectionEntry {
            user_id,
            film_id,
            own,
        };
        (&users, &films, &collections).transaction(|(users, films, collections)| {
            if users.get(&user_key)?.is_none() {
                return abort(Error::NotFound("user"));
            }
            if films.get(&film_key)?.is_none() {
                return abort(Error::NotFound("film"));
            }
            let mut entries: Vec<CollectionEntry> = match collections.get(&user_key)? {
                Some(value) => decode(&value).map_err(ConflictableTransactionError::Abort)?,
                None => Vec::new(),
            };
            match entries.iter_mut().find(|e| e.film_id == film_id) {
                Some(existing) => existing.own = own,
                None => entries.push(entry.clone()),
            }
            let value = encode(&entries).map_err(ConflictableTransactionError::Abort)?;
            collections.insert(&user_key, value)?;
            Ok(())
        })?;
        Ok(entry)
    }

    fn list_collection(&self, user_id: u64) -> Result<Vec<(CollectionEntry, Film)>, Error> {
        let collections = self.open_tree(COLLECTIONS)?;
        let entries: Vec<CollectionEntry> = match collections.get(serialize_id(user_id))? {
            Some(value) => decode(&value)?,
            None => return Ok(Vec::new()),
        };
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let film = self
                .get_film(entry.film_id)?
                .ok_or(Error::Corrupt("collections"))?;
            items.push((entry, film));
        }
        Ok(items)
    }

    fn remove_from_collection(&self, user_id: u64, film_id: u64) -> Result<usize, Error> {
        let collections = self.open_tree(COLLECTIONS)?;
        let key = serialize_id(user_id);
        let removed = collections.transaction(|collections| {
            let mut entries: Vec<CollectionEntry> = match collections.get(&key)? {
                Some(value) => decode(&value).map_err(ConflictableTransactionError::Abort)?,
                None => return Ok(0),
            };
            let before = entries.len();
            entries.retain(|e| e.film_id != film_id);
            let removed = before - entries.len();
            if entries.is_empty() {
                collections.remove(&key)?;
            } else if removed > 0 {
                let value = encode(&entries).map_err(ConflictableTransactionError::Abort)?;
                collections.insert(&key, value)?;
            }
            Ok(removed)
        })?;
        Ok(removed)
    }
}

pub trait SessionDb {
    type Error;
    /// Stores a new session for the user and returns its opaque token.
    fn create_session(&self, user_id: u64, ttl_secs: u64) -> Result<String, Self::Error>;
    /// Returns the session if it exists and has not expired. Expired
    /// sessions are removed on the way.
    fn get_session(&self, token: &str) -> Result<Option<Session>, Self::Error>;
    fn delete_session(&self, token: &str) -> Result<(), Self::Error>;
    fn delete_user_sessions(&self, user_id: u64) -> Result<usize, Self::Error>;
    fn purge_expired_sessions(&self) -> Result<usize, Self::Error>;
}

impl SessionDb for sled::Db {
    type Error = Error;

    fn create_session(&self, user_id: u64, ttl_secs: u64) -> Result<String, Error> {
        let sessions = self.open_tree(SESSIONS)?;
        let token = uuid::Uuid::new_v4().to_string();
        let session = Session {
            user_id,
            expires_at: now().saturating_add(ttl_secs),
        };
        sessions.insert(token.as_bytes(), encode(&session)?)?;
        Ok(token)
    }

    fn get_session(&self, token: &str) -> Result<Option<Session>, Error> {
        let sessions = self.open_tree(SESSIONS)?;
        let session: Session = match sessions.get(token.as_bytes())? {
            Some(value) => decode(&value)?,
            None => return Ok(None),
        };
        if session.expires_at <= now() {
            sessions.remove(token.as_bytes())?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    fn delete_session(&self, token: &str) -> Result<(), Error> {
        self.open_tree(SESSIONS)?.remove(token.as_bytes())?;
        Ok(())
    }

    fn delete_user_sessions(&self, user_id: u64) -> Result<usize, Error> {
        remove_sessions_where(self, |session| session.user_id == user_id)
    }

    fn purge_expired_sessions(&self) -> Result<usize, Error> {
        let now = now();
        remove_sessions_where(self, |session| session.expires_at <= now)
    }
}

fn remove_sessions_where<F: Fn(&Session) -> bool>(db: &sled::Db, pred: F) -> Result<usize, Error> {
    let sessions = db.open_tree(SESSIONS)?;
    let mut removed = 0;
    for entry in sessions.iter() {
        let (token, value) = entry?;
        let session: Session = decode(&value)?;
        if pred(&session) {
            sessions.remove(token)?;
            removed += 1;
        }
    }
    Ok(removed)
}
