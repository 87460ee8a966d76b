use anyhow::Context;
use bstr::BString;
use liblinescan::profile::ProfileOverrides;
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path, path::PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Default::default")]
    pub backend: Backend,

    pub devices: Vec<DeviceEntry>,

    #[serde(default = "Default::default")]
    pub scan: Scan,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Backend {
    pub calibration_dir: Option<PathBuf>,

    #[serde(default = "Default::default")]
    pub scheduler: SchedulerKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Thread,
    Tokio,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub name: String,

    pub model: String,

    #[serde(default = "Default::default")]
    pub overrides: ProfileOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scan {
    pub device: Option<String>,

    #[serde(default = "Default::default")]
    pub options: HashMap<BString, BString>,
}

impl Config {
    pub fn read_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let dpath = path.display();

        let raw = fs::read_to_string(path).with_context(|| format!("reading file '{dpath}'"))?;
        let config = toml::from_str(&raw).with_context(|| format!("parsing file '{dpath}'"))?;

        Ok(config)
    }
}
