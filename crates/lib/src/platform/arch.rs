use std::fmt;
use std::str::FromStr;

/// CPU architecture variants a formula can be conditioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  X86_64,
  X86,
  Aarch64,
  PowerPc,
  PowerPc64,
}

impl Arch {
  /// Detect the current CPU architecture at runtime
  pub fn current() -> Option<Self> {
    match std::env::consts::ARCH {
      "x86_64" => Some(Self::X86_64),
      "x86" => Some(Self::X86),
      "aarch64" => Some(Self::Aarch64),
      "powerpc" => Some(Self::PowerPc),
      "powerpc64" => Some(Self::PowerPc64),
      _ => None,
    }
  }

  /// Returns the lowercase string identifier for this architecture
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::X86_64 => "x86_64",
      Self::X86 => "i686",
      Self::Aarch64 => "aarch64",
      Self::PowerPc => "powerpc",
      Self::PowerPc64 => "powerpc64",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for Arch {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "x86_64" | "amd64" => Ok(Self::X86_64),
      "x86" | "i386" | "i686" => Ok(Self::X86),
      "aarch64" | "arm64" => Ok(Self::Aarch64),
      "powerpc" | "ppc" => Ok(Self::PowerPc),
      "powerpc64" | "ppc64" => Ok(Self::PowerPc64),
      other => Err(format!("unknown architecture: {other}")),
    }
  }
}
