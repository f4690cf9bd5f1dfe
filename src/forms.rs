//! Raw form payloads and their validation.
//!
//! Every field is deserialized as a string with `#[serde(default)]`, so a
//! missing or malformed value becomes a field error on the re-rendered page
//! instead of an extractor rejection.

use crate::model::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const REQUIRED: &str = "This field is required.";

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<&'static str, Vec<String>>);

impl FieldErrors {
    pub fn single(field: &'static str, message: impl Into<String>) -> Self {
        let mut errors = Self::default();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.entry(field).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    fn finish<T>(self, value: T) -> Result<T, FieldErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

fn text(errors: &mut FieldErrors, field: &'static str, value: &str, max: usize) -> String {
    let value = value.trim();
    if value.is_empty() {
        errors.add(field, REQUIRED);
    } else if value.chars().count() > max {
        errors.add(field, format!("Must be at most {} characters.", max));
    }
    value.to_owned()
}

fn email(errors: &mut FieldErrors, value: &str) -> String {
    let value = text(errors, "email", value, 500);
    if !value.is_empty() {
        let valid = match value.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !value.contains(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            errors.add("email", "Invalid email address.");
        }
    }
    value
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegisterForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub details: AccountDetails,
    pub password: String,
}

impl RegisterForm {
    pub fn validate(&self) -> Result<Registration, FieldErrors> {
        let mut errors = FieldErrors::default();
        let first_name = text(&mut errors, "first_name", &self.first_name, 30);
        let last_name = text(&mut errors, "last_name", &self.last_name, 30);
        let email = email(&mut errors, &self.email);
        if self.password.trim().is_empty() {
            errors.add("password", REQUIRED);
        }
        if self.confirm_password.trim().is_empty() {
            errors.add("confirm_password", REQUIRED);
        } else if self.confirm_password != self.password {
            errors.add("confirm_password", "Passwords must match.");
        }
        errors.finish(Registration {
            details: AccountDetails {
                first_name,
                last_name,
                email,
            },
            password: self.password.clone(),
        })
    }

    /// Drops the secrets before the form is echoed back to the browser.
    pub fn without_passwords(mut self) -> Self {
        self.password.clear();
        self.confirm_password.clear();
        self
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    pub remember: Option<String>,
}

impl LoginForm {
    pub fn remember(&self) -> bool {
        match self.remember.as_deref() {
            Some(value) => !value.is_empty() && value != "false" && value != "0",
            None => false,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl AccountForm {
    pub fn validate(&self) -> Result<AccountDetails, FieldErrors> {
        let mut errors = FieldErrors::default();
        let details = AccountDetails {
            first_name: text(&mut errors, "first_name", &self.first_name, 30),
            last_name: text(&mut errors, "last_name", &self.last_name, 30),
            email: email(&mut errors, &self.email),
        };
        errors.finish(details)
    }
}

impl From<&User> for AccountForm {
    fn from(user: &User) -> Self {
        AccountForm {
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilmForm {
    pub title: String,
    pub year: String,
    pub age: String,
    pub director: String,
    pub genre: String,
    pub format: String,
    pub description: String,
    pub code: String,
}

impl FilmForm {
    pub fn validate(&self) -> Result<Film, FieldErrors> {
        let mut errors = FieldErrors::default();
        let title = text(&mut errors, "title", &self.title, 100);
        let age = text(&mut errors, "age", &self.age, 5);
        let director = text(&mut errors, "director", &self.director, 100);
        let genre = text(&mut errors, "genre", &self.genre, 20);
        let format = text(&mut errors, "format", &self.format, 10);
        let description = text(&mut errors, "description", &self.description, 500);

        let year = match self.year.trim() {
            "" => {
                errors.add("year", REQUIRED);
                0
            }
            year => match year.parse::<u16>() {
                Ok(year) if (1000..=9999).contains(&year) => year,
                _ => {
                    errors.add("year", "Must be a four-digit year.");
                    0
                }
            },
        };

        let code = match self.code.trim() {
            "" => {
                errors.add("code", REQUIRED);
                0
            }
            code if code.len() <= 15 && code.bytes().all(|b| b.is_ascii_digit()) => {
                code.parse::<u64>().unwrap_or_default()
            }
            _ => {
                errors.add("code", "Must be a number of at most 15 digits.");
                0
            }
        };

        errors.finish(Film {
            title,
            year,
            age,
            director,
            genre,
            format,
            description,
            code,
        })
    }
}

impl From<&Film> for FilmForm {
    fn from(film: &Film) -> Self {
        FilmForm {
            title: film.title.clone(),
            year: film.year.to_string(),
            age: film.age.clone(),
            director: film.director.clone(),
            genre: film.genre.clone(),
            format: film.format.clone(),
            description: film.description.clone(),
            code: film.code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn film_form() -> FilmForm {
        FilmForm {
            title: "Test Matrix 1001".to_owned(),
            year: "2020".to_owned(),
            age: "U".to_owned(),
            director: "Test-System".to_owned(),
            genre: "Invasion".to_owned(),
            format: "Plug In".to_owned(),
            description: "This is a virus sent to test the functionality of this data".to_owned(),
            code: "56735729".to_owned(),
        }
    }

    fn register_form() -> RegisterForm {
        RegisterForm {
            first_name: "NewSystem".to_owned(),
            last_name: "Testing".to_owned(),
            email: "NewSystem@Testing.com".to_owned(),
            password: "N3wSy5temT35t1n8".to_owned(),
            confirm_password: "N3wSy5temT35t1n8".to_owned(),
        }
    }

    #[test]
    fn valid_film_form_parses_numbers() {
        let film = film_form().validate().unwrap();
        assert_eq!(film.year, 2020);
        assert_eq!(film.code, 56735729);
        assert_eq!(FilmForm::from(&film).validate().unwrap(), film);
    }

    #[test]
    fn film_form_reports_every_bad_field() {
        let form = FilmForm {
            title: "   ".to_owned(),
            year: "20x0".to_owned(),
            genre: "x".repeat(21),
            code: "-5".to_owned(),
            ..film_form()
        };
        let errors = form.validate().unwrap_err();
        assert_eq!(errors.get("title"), Some(&[REQUIRED.to_owned()][..]));
        assert!(errors.get("year").is_some());
        assert!(errors.get("genre").is_some());
        assert!(errors.get("code").is_some());
        assert!(errors.get("director").is_none());
    }

    #[test]
    fn film_code_longer_than_fifteen_digits_is_rejected() {
        let form = FilmForm {
            code: "1234567890123456".to_owned(),
            ..film_form()
        };
        assert!(form.validate().unwrap_err().get("code").is_some());
    }

    #[test]
    fn registration_trims_names_and_keeps_password() {
        let form = RegisterForm {
            first_name: "  NewSystem ".to_owned(),
            ..register_form()
        };
        let registration = form.validate().unwrap();
        assert_eq!(registration.details.first_name, "NewSystem");
        assert_eq!(registration.password, "N3wSy5temT35t1n8");
    }

    #[test]
    fn whitespace_password_counts_as_missing() {
        let form = RegisterForm {
            password: "   ".to_owned(),
            confirm_password: "\t ".to_owned(),
            ..register_form()
        };
        let errors = form.validate().unwrap_err();
        assert_eq!(errors.get("password"), Some(&[REQUIRED.to_owned()][..]));
        assert_eq!(
            errors.get("confirm_password"),
            Some(&[REQUIRED.to_owned()][..])
        );
    }

    #[test]
    fn registration_requires_matching_confirmation() {
        let form = RegisterForm {
            confirm_password: "something else".to_owned(),
            ..register_form()
        };
        let errors = form.validate().unwrap_err();
        assert_eq!(
            errors.get("confirm_password"),
            Some(&["Passwords must match.".to_owned()][..])
        );
    }

    #[test]
    fn registration_requires_every_field() {
        let errors = RegisterForm::default().validate().unwrap_err();
        for field in &[
            "first_name",
            "last_name",
            "email",
            "password",
            "confirm_password",
        ] {
            assert!(errors.get(field).is_some(), "{} should be required", field);
        }
    }

    #[test]
    fn malformed_email_is_rejected() {
        for bad in &["no-at-sign", "@Testing.com", "a@b@c", "a b@c.com"] {
            let form = AccountForm {
                first_name: "System".to_owned(),
                last_name: "Testing".to_owned(),
                email: bad.to_string(),
            };
            assert!(form.validate().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn remember_checkbox_values() {
        let mut form = LoginForm::default();
        assert!(!form.remember());
        form.remember = Some("on".to_owned());
        assert!(form.remember());
        form.remember = Some("false".to_owned());
        assert!(!form.remember());
    }

    #[test]
    fn field_errors_display_lists_all_messages() {
        let mut errors = FieldErrors::single("code", "taken");
        errors.add("description", "taken");
        assert_eq!(errors.to_string(), "code: taken; description: taken");
    }
}
