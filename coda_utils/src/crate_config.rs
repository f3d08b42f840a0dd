//! This module contains the logic for parsing the CODA crate configuration files.
//!
//! A configuration file holds one or more `CRATE <name>` ... `CRATE end` sections (one per
//! readout controller). Inside a section, a `<PREFIX>_SLOT` line selects which boards of the
//! `<PREFIX>` family the following `<PREFIX>_<KEY> <values...>` lines apply to, either `all`
//! or a list of slot numbers. Anything after a `#` is a comment.
use kstring::KString;
use nom::{
    bytes::complete::take_till1,
    character::complete::{
        char,
        not_line_ending,
        space0,
        space1,
    },
    combinator::{
        eof,
        opt,
    },
    multi::separated_list1,
    sequence::{
        delimited,
        preceded,
        tuple,
    },
    IResult,
};
use std::{
    collections::HashMap,
    io::Read,
    path::Path,
    str::from_utf8,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid UTF8 in the configuration file")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Line {0} doesn't match the configuration grammar")]
    ParseMatch(usize),
    #[error("Line {line}: `{value}` is not a slot number")]
    BadSlot { line: usize, value: String },
    #[error("Line {0}: setting found outside of a CRATE section")]
    OutsideCrate(usize),
    #[error("Line {0}: CRATE needs a name")]
    MissingCrateName(usize),
    #[error("CRATE `{0}` is never closed with `CRATE end`")]
    Unterminated(String),
}

/// Which boards of a family a setting applies to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Slots(Vec<u8>),
}

impl Scope {
    /// Does this scope cover `slot`
    #[must_use]
    pub fn contains(&self, slot: u8) -> bool {
        match self {
            Scope::All => true,
            Scope::Slots(slots) => slots.contains(&slot),
        }
    }
}

/// One `<PREFIX>_<KEY> <values...>` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub scope: Scope,
    pub key: KString,
    pub values: Vec<String>,
}

/// The settings of a single `CRATE` section, in file order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CrateSection {
    pub settings: Vec<Setting>,
}

impl CrateSection {
    /// Look up the values of `<prefix>_<key>` for the board in `slot`. Later lines win, so a
    /// slot-specific setting after an `all` setting overrides it.
    #[must_use]
    pub fn lookup(&self, prefix: &str, key: &str, slot: u8) -> Option<&[String]> {
        let full = format!("{prefix}_{key}");
        self.settings
            .iter()
            .rev()
            .find(|s| s.key.eq_ignore_ascii_case(&full) && s.scope.contains(slot))
            .map(|s| s.values.as_slice())
    }

    /// Look up a crate-wide setting `<prefix>_<key>`, ignoring slot scoping
    #[must_use]
    pub fn lookup_global(&self, prefix: &str, key: &str) -> Option<&[String]> {
        let full = format!("{prefix}_{key}");
        self.settings
            .iter()
            .rev()
            .find(|s| s.key.eq_ignore_ascii_case(&full))
            .map(|s| s.values.as_slice())
    }
}

/// A parsed configuration file, keyed by crate (readout controller) name
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CrateConfig {
    pub crates: HashMap<KString, CrateSection>,
}

impl CrateConfig {
    /// Get the section for the crate named `name`
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&CrateSection> {
        self.crates.get(name)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Blank,
    CrateStart(&'a str),
    CrateEnd,
    Entry { key: &'a str, values: Vec<&'a str> },
}

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(char('#'), not_line_ending)(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace() || c == '#')(input)
}

fn tokens(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list1(space1, token)(input)
}

fn words(input: &str) -> IResult<&str, Option<Vec<&str>>> {
    delimited(space0, opt(tokens), tuple((space0, opt(comment), eof)))(input)
}

fn line(input: &str, number: usize) -> Result<Line, Error> {
    let (_, words) = words(input).map_err(|_| Error::ParseMatch(number))?;
    let Some(words) = words else {
        return Ok(Line::Blank);
    };
    let (first, rest) = match words.split_first() {
        Some(split) => split,
        None => return Ok(Line::Blank),
    };
    if first.eq_ignore_ascii_case("CRATE") {
        return match rest.first() {
            Some(name) if name.eq_ignore_ascii_case("end") => Ok(Line::CrateEnd),
            Some(name) => Ok(Line::CrateStart(name)),
            None => Err(Error::MissingCrateName(number)),
        };
    }
    Ok(Line::Entry {
        key: first,
        values: rest.to_vec(),
    })
}

fn scope(values: &[&str], number: usize) -> Result<Scope, Error> {
    if values.iter().any(|v| v.eq_ignore_ascii_case("all")) {
        return Ok(Scope::All);
    }
    values
        .iter()
        .map(|v| {
            v.parse::<u8>().map_err(|_| Error::BadSlot {
                line: number,
                value: (*v).to_owned(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Scope::Slots)
}

fn family_prefix(key: &str) -> &str {
    key.split_once('_').map_or(key, |(prefix, _)| prefix)
}

/// Parse the contents of a crate configuration file
/// # Errors
/// Returns an error (with the offending line number) on malformed files
pub fn parse_crate_config(input: &str) -> Result<CrateConfig, Error> {
    let mut config = CrateConfig::default();
    // The open section and the active slot scope of every family prefix in it
    let mut open: Option<(KString, CrateSection, HashMap<String, Scope>)> = None;

    for (idx, raw) in input.lines().enumerate() {
        let number = idx + 1;
        match line(raw, number)? {
            Line::Blank => {}
            Line::CrateStart(name) => {
                if let Some((prev, ..)) = &open {
                    return Err(Error::Unterminated(prev.to_string()));
                }
                open = Some((KString::from_ref(name), CrateSection::default(), HashMap::new()));
            }
            Line::CrateEnd => {
                let (name, section, _) = open.take().ok_or(Error::OutsideCrate(number))?;
                config.crates.insert(name, section);
            }
            Line::Entry { key, values } => {
                let (_, section, scopes) = open.as_mut().ok_or(Error::OutsideCrate(number))?;
                let upper = key.to_ascii_uppercase();
                if let Some(prefix) = upper
                    .strip_suffix("_SLOTS")
                    .or_else(|| upper.strip_suffix("_SLOT"))
                {
                    scopes.insert(prefix.to_owned(), scope(&values, number)?);
                    continue;
                }
                let scope = scopes
                    .get(family_prefix(&upper))
                    .cloned()
                    .unwrap_or_default();
                section.settings.push(Setting {
                    scope,
                    key: KString::from_string(upper),
                    values: values.iter().map(|v| (*v).to_owned()).collect(),
                });
            }
        }
    }
    if let Some((name, ..)) = open {
        return Err(Error::Unterminated(name.to_string()));
    }
    Ok(config)
}

/// Reads a CODA crate configuration file
/// # Errors
/// Returns an error on IO errors and invalid files
pub fn read_crate_config<T>(filename: T) -> Result<CrateConfig, Error>
where
    T: AsRef<Path>,
{
    let mut file = std::fs::File::open(filename)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    parse_crate_config(from_utf8(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment() {
        let (remaining, text) = comment("# block level for run 1234").unwrap();
        assert_eq!(remaining, "");
        assert_eq!(text, " block level for run 1234");
    }

    #[test]
    fn test_words() {
        let (_, setting) = words("  F1_BLOCK_LEVEL   4  # events per block").unwrap();
        assert_eq!(setting, Some(vec!["F1_BLOCK_LEVEL", "4"]));
        let (_, comment_only) = words("   # only a comment").unwrap();
        assert_eq!(comment_only, None);
    }

    #[test]
    fn test_line() {
        assert_eq!(line("CRATE roc1", 1).unwrap(), Line::CrateStart("roc1"));
        assert_eq!(line("crate END", 1).unwrap(), Line::CrateEnd);
        assert_eq!(line("", 1).unwrap(), Line::Blank);
        assert_eq!(
            line("F1_SLOT 3 5", 1).unwrap(),
            Line::Entry {
                key: "F1_SLOT",
                values: vec!["3", "5"]
            }
        );
        assert!(matches!(line("CRATE", 7), Err(Error::MissingCrateName(7))));
    }

    #[test]
    fn test_crate_config() {
        let input = "# tdc crate
CRATE roc1
F1_SLOT all
F1_BLOCK_LEVEL 1
F1_BERR 1
F1_SLOT 5 7
F1_BLOCK_LEVEL 4
F1_MULTIBLOCK p0
CRATE end

CRATE roc2
SSP_BLOCK_LEVEL 2
CRATE end
";
        let config = parse_crate_config(input).unwrap();
        assert_eq!(config.crates.len(), 2);
        let roc1 = config.section("roc1").unwrap();
        assert_eq!(roc1.lookup("F1", "BLOCK_LEVEL", 3).unwrap(), ["1"]);
        assert_eq!(roc1.lookup("F1", "BLOCK_LEVEL", 5).unwrap(), ["4"]);
        assert_eq!(roc1.lookup("F1", "BERR", 7).unwrap(), ["1"]);
        assert_eq!(roc1.lookup_global("F1", "MULTIBLOCK").unwrap(), ["p0"]);
        assert!(roc1.lookup("SSP", "BLOCK_LEVEL", 3).is_none());
        let roc2 = config.section("roc2").unwrap();
        assert_eq!(roc2.lookup("SSP", "BLOCK_LEVEL", 20).unwrap(), ["2"]);
    }

    #[test]
    fn test_bad_slot() {
        let input = "CRATE roc1\nF1_SLOT 5 x\nCRATE end\n";
        match parse_crate_config(input) {
            Err(Error::BadSlot { line, value }) => {
                assert_eq!(line, 2);
                assert_eq!(value, "x");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_unterminated() {
        assert!(matches!(
            parse_crate_config("CRATE roc1\nF1_BERR 1\n"),
            Err(Error::Unterminated(name)) if name == "roc1"
        ));
        assert!(matches!(
            parse_crate_config("F1_BERR 1\n"),
            Err(Error::OutsideCrate(1))
        ));
    }
}
