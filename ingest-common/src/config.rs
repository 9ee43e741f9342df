//! Value types for `envconfig` fields shared by the ingest and replay services.
use std::str::FromStr;
use std::time;

/// A duration configured as a whole number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// A comma separated list, blank entries dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ms_durations() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(250)))
        );
        assert_eq!("-1".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }

    #[test]
    fn rejects_empty_strings() {
        assert_eq!("  ".parse::<NonEmptyString>(), Err(StringIsEmptyError));
        assert_eq!(
            "dead-letter".parse::<NonEmptyString>().unwrap().as_str(),
            "dead-letter"
        );
    }

    #[test]
    fn splits_comma_lists() {
        let parsed: CommaSeparated = "phone, to,,from ".parse().unwrap();
        assert_eq!(parsed.0, vec!["phone", "to", "from"]);
    }
}
