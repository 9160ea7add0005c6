use std::fmt;
use std::str::FromStr;

/// Operating system families a formula can be conditioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  MacOs,
  FreeBsd,
  Windows,
}

impl Os {
  /// Detect the current operating system at runtime
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::MacOs),
      "freebsd" => Some(Self::FreeBsd),
      "windows" => Some(Self::Windows),
      _ => None,
    }
  }

  /// Returns the lowercase string identifier for this OS
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::MacOs => "darwin",
      Self::FreeBsd => "freebsd",
      Self::Windows => "windows",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for Os {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "linux" => Ok(Self::Linux),
      "darwin" | "macos" | "osx" => Ok(Self::MacOs),
      "freebsd" => Ok(Self::FreeBsd),
      "windows" => Ok(Self::Windows),
      other => Err(format!("unknown operating system: {other}")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn macos_uses_darwin_identifier() {
    assert_eq!(Os::MacOs.as_str(), "darwin");
  }

  #[test]
  fn parse_accepts_aliases() {
    assert_eq!("macos".parse::<Os>().unwrap(), Os::MacOs);
    assert_eq!("Darwin".parse::<Os>().unwrap(), Os::MacOs);
    assert_eq!("linux".parse::<Os>().unwrap(), Os::Linux);
    assert!("plan9".parse::<Os>().is_err());
  }
}
