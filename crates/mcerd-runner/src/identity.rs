use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RunnerError;

const DEFAULT_NAME: &str = "Default";

/// Element or isotope a result registry is scoped to. The canonical string
/// (`4He`, `O`, `12C`) is the prefix of every worker output file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoilElementIdentity {
    symbol: String,
    isotope: Option<u32>,
    name: String,
}

impl RecoilElementIdentity {
    pub fn new(symbol: &str, isotope: Option<u32>) -> Result<Self, RunnerError> {
        if !is_valid_symbol(symbol) {
            return Err(RunnerError::InvalidIdentity(symbol.to_string()));
        }
        Ok(Self {
            symbol: symbol.to_string(),
            isotope,
            name: DEFAULT_NAME.to_string(),
        })
    }

    /// Replaces the human readable name, which becomes the label segment of
    /// output file names.
    pub fn with_name(mut self, name: &str) -> Result<Self, RunnerError> {
        if name.is_empty() || name.contains(['.', '/', '\\']) {
            return Err(RunnerError::InvalidIdentity(format!(
                "{} (name '{}')",
                self.canonical(),
                name
            )));
        }
        self.name = name.to_string();
        Ok(self)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn isotope(&self) -> Option<u32> {
        self.isotope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn canonical(&self) -> String {
        match self.isotope {
            Some(mass) => format!("{}{}", mass, self.symbol),
            None => self.symbol.clone(),
        }
    }
}

impl fmt::Display for RecoilElementIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for RecoilElementIdentity {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| RunnerError::InvalidIdentity(s.to_string()))?;
        let (mass, symbol) = s.split_at(split);
        let isotope = if mass.is_empty() {
            None
        } else {
            let parsed = mass
                .parse::<u32>()
                .map_err(|_| RunnerError::InvalidIdentity(s.to_string()))?;
            Some(parsed)
        };
        if !is_valid_symbol(symbol) {
            return Err(RunnerError::InvalidIdentity(s.to_string()));
        }
        Self::new(symbol, isotope)
    }
}

fn is_valid_symbol(symbol: &str) -> bool {
    let mut chars = symbol.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    let rest: Vec<char> = chars.collect();
    rest.len() <= 2 && rest.iter().all(|c| c.is_ascii_lowercase())
}
