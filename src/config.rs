use std::path::Path;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{error::Error, registry::BoardModel, serial};

/// A usb vendor:product pair and the board model it maps to.
///
/// Extends (and may override) the built-in classification table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownBoard {
    /// Four lowercase hex digits, colon, four lowercase hex digits.
    /// E.g. `"2341:0043"`.
    pub usb_id: String,

    /// What to classify a match as.
    pub model: BoardModel,
}

/// One identity's lab access: how it authenticates and when it may
/// use the devices.
///
/// This is the stand-in for the external token service and booking
/// database. An entry must carry a token, a full credential pair, or
/// both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEntry {
    /// The identity the entry resolves to.
    pub identity: String,

    /// Bearer token accepted for this identity.
    pub token: Option<String>,

    /// Email of the legacy credential pair.
    pub email: Option<String>,

    /// Password of the legacy credential pair.
    pub password: Option<String>,

    /// The hours (0-23) this identity has booked.
    pub hours: Vec<u32>,
}

/// The configuration used for running the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Board classifications on top of the built-in table.
    pub known_boards: Vec<KnownBoard>,

    /// Baud rate for sessions started on behalf of subscribers.
    pub default_baud: u32,

    /// Who may access the lab, and when.
    pub access: Vec<AccessEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            known_boards: Vec::new(),
            default_baud: serial::DEFAULT_BAUD,
            access: Vec::new(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            known_boards: vec![KnownBoard {
                usb_id: "2341:0058".into(),
                model: BoardModel::Uno,
            }],
            default_baud: serial::DEFAULT_BAUD,
            access: vec![
                AccessEntry {
                    identity: "alice@lab.example".into(),
                    token: Some("alice-dev-token".into()),
                    email: None,
                    password: None,
                    hours: vec![8, 9, 10],
                },
                AccessEntry {
                    identity: "bob@lab.example".into(),
                    token: None,
                    email: Some("bob@lab.example".into()),
                    password: Some("hunter2".into()),
                    hours: (0..24).collect(),
                },
            ],
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    fn check_baud(&self) -> Result<(), Error> {
        if self.default_baud == 0 {
            return Err(Error::BadConfig(
                "The default baud rate cannot be zero.".into(),
            ));
        }

        Ok(())
    }

    fn check_usb_id_format(&self) -> Result<(), Error> {
        for board in &self.known_boards {
            let well_formed = board.usb_id.len() == 9
                && board.usb_id.as_bytes()[4] == b':'
                && board
                    .usb_id
                    .chars()
                    .enumerate()
                    .all(|(at, c)| at == 4 || c.is_ascii_hexdigit());

            if !well_formed {
                return Err(Error::BadConfig(format!(
                    "Usb ids look like `2341:0043` (lowercase hex). Problem: `{}`.",
                    board.usb_id
                )));
            }
        }

        Ok(())
    }

    fn check_duplicate_usb_ids(&self) -> Result<(), Error> {
        let duplicates = self
            .known_boards
            .iter()
            .map(|board| &board.usb_id)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "A usb id can only map to one board model. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_access_credentials(&self) -> Result<(), Error> {
        for (index, entry) in self.access.iter().enumerate() {
            let has_token = entry.token.is_some();
            let has_pair = entry.email.is_some() && entry.password.is_some();

            if !has_token && !has_pair {
                return Err(Error::BadConfig(format!(
                    "The access entry with index {index} (zero indexed) has no way to authenticate. Give it a token or an email+password pair."
                )));
            }
        }

        Ok(())
    }

    fn check_access_hours(&self) -> Result<(), Error> {
        for entry in &self.access {
            if let Some(bad) = entry.hours.iter().find(|&&hour| hour > 23) {
                return Err(Error::BadConfig(format!(
                    "Hours are 0-23. The entry for `{}` has {bad}.",
                    entry.identity
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.check_baud()?;
        self.check_usb_id_format()?;
        self.check_duplicate_usb_ids()?;
        self.check_access_credentials()?;
        self.check_access_hours()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!(
            "{}",
            ron::ser::to_string_pretty(&c, ron::ser::PrettyConfig::default()).unwrap()
        );
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    known_boards: [
        (
            usb_id: "2341:0058",
            model: uno,
        ),
    ],
    default_baud: 115200,
    access: [
        (
            identity: "alice@lab.example",
            token: "alice-dev-token",
            email: None,
            password: None,
            hours: [8, 9, 10],
        ),
    ],
)
"#;
        let config = Config::deserialize(input);

        assert_eq!(config.default_baud, 115_200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn example_config_is_valid() {
        assert!(Config::example().validate().is_ok());
    }

    #[test]
    fn bad_config_duplicates() {
        let mut c = Config::example();
        c.known_boards = vec![
            KnownBoard {
                usb_id: "2341:0043".into(),
                model: BoardModel::Uno,
            },
            KnownBoard {
                usb_id: "1a86:7523".into(),
                model: BoardModel::Uno,
            },
            KnownBoard {
                usb_id: "2341:0043".into(), // Duplicate!
                model: BoardModel::Mega,
            },
        ];

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        // Let's do some assertions that enforces our error messages to at least be decent.
        assert!(err.contains("2341:0043"));
        assert!(!err.contains("1a86:7523"));
    }

    #[test]
    fn bad_config_usb_id_format() {
        let mut c = Config::example();
        c.known_boards = vec![KnownBoard {
            usb_id: "not-an-id".into(),
            model: BoardModel::Uno,
        }];

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("not-an-id"));
    }

    #[test]
    fn bad_config_no_credentials() {
        let mut c = Config::example();
        c.access.push(AccessEntry {
            identity: "ghost@lab.example".into(),
            token: None,
            email: Some("ghost@lab.example".into()),
            password: None, // Half a pair doesn't count.
            hours: vec![1],
        });

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        // Error message contains the index of our bad entry.
        assert!(err.contains("index 2"));
    }

    #[test]
    fn bad_config_hour_out_of_range() {
        let mut c = Config::example();
        c.access[0].hours.push(24);

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("alice@lab.example"));
        assert!(err.contains("24"));
    }

    #[test]
    fn bad_config_zero_baud() {
        let mut c = Config::example();
        c.default_baud = 0;

        assert!(c.validate().is_err());
    }
}
