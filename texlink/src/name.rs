//! Supported interpreter variants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineName {
    PdfTex,
    XeTex,
    LuaTex,
}

impl EngineName {
    pub const ALL: [EngineName; 3] = [Self::PdfTex, Self::XeTex, Self::LuaTex];

    /// Single character that prefixes the handshake line.
    pub fn tag(&self) -> char {
        match self {
            Self::PdfTex => 'p',
            Self::XeTex => 'x',
            Self::LuaTex => 'l',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.tag() == tag)
    }

    /// LaTeX-format executable for this engine.
    pub fn latex_executable(&self) -> &'static str {
        match self {
            Self::PdfTex => "pdflatex",
            Self::XeTex => "xelatex",
            Self::LuaTex => "lualatex",
        }
    }

    pub fn is_unicode(&self) -> bool {
        !matches!(self, Self::PdfTex)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfTex => "pdftex",
            Self::XeTex => "xetex",
            Self::LuaTex => "luatex",
        }
    }
}

impl fmt::Display for EngineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown engine '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_and_invertible() {
        for name in EngineName::ALL {
            assert_eq!(EngineName::from_tag(name.tag()), Some(name));
        }
        assert_eq!(EngineName::from_tag('u'), None);
    }

    #[test]
    fn parses_lowercase_names() {
        assert_eq!("luatex".parse::<EngineName>().unwrap(), EngineName::LuaTex);
        assert!("ptex".parse::<EngineName>().is_err());
    }

    #[test]
    fn only_pdftex_is_byte_based() {
        assert!(!EngineName::PdfTex.is_unicode());
        assert!(EngineName::XeTex.is_unicode());
        assert!(EngineName::LuaTex.is_unicode());
        assert_eq!(EngineName::XeTex.latex_executable(), "xelatex");
    }
}
