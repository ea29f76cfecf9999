use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use super::ValueMut;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: ValueMut<To>,
    #[serde(default = "Log::level_default")]
    pub level: ValueMut<Level>,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> ValueMut<To> {
        ValueMut::new(To::Console)
    }
    #[inline]
    fn level_default() -> ValueMut<Level> {
        ValueMut::new(Level(slog::Level::Info))
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/embermq".into()
    }
    #[inline]
    fn file_default() -> String {
        "embermq.log".into()
    }

    #[inline]
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return "".into();
        }
        if self.dir.is_empty() {
            return self.file.clone();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        format!("{}/{}", dir, self.file)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let to = match String::deserialize(deserializer)?.to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            _ => To::Both,
        };
        Ok(to)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn new(l: slog::Level) -> Self {
        Level(l)
    }
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let level = slog::Level::from_str(&s)
            .map_err(|_| de::Error::custom(format!("unknown log level '{s}'")))?;
        Ok(Level(level))
    }
}
