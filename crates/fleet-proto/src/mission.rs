use serde::{Deserialize, Deserializer, Serialize};

/// Navigation command ids used when synthesizing missions.
pub mod cmd {
    pub const NAV_WAYPOINT: u16 = 16;
    pub const NAV_LAND: u16 = 21;
    pub const NAV_TAKEOFF: u16 = 22;
}

/// Coordinate frame ids.
pub mod frame {
    pub const GLOBAL: u8 = 0;
    pub const GLOBAL_RELATIVE_ALT: u8 = 3;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub seq: u16,
    #[serde(deserialize_with = "flag")]
    pub current: bool,
    pub frame: u8,
    pub command: u16,
    pub param1: f64,
    pub param2: f64,
    pub param3: f64,
    pub param4: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(rename = "autoContinue", deserialize_with = "flag")]
    pub autocontinue: bool,
}

impl Waypoint {
    /// A plain navigation waypoint with zeroed params.
    pub fn nav(seq: u16, frame: u8, command: u16, lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            seq,
            current: false,
            frame,
            command,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            lat,
            lon,
            alt,
            autocontinue: true,
        }
    }
}

/// Ordered waypoint list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub items: Vec<Waypoint>,
}

impl Mission {
    pub fn new(items: Vec<Waypoint>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First position where `seq` breaks the `0..N` run, if any.
    pub fn first_gap(&self) -> Option<(usize, u16)> {
        self.items
            .iter()
            .enumerate()
            .find(|(i, w)| usize::from(w.seq) != *i)
            .map(|(i, w)| (i, w.seq))
    }
}

/// User-supplied waypoint; unset fields take mission defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointSpec {
    #[serde(default)]
    pub seq: Option<u16>,
    #[serde(default, deserialize_with = "opt_flag")]
    pub current: Option<bool>,
    #[serde(default)]
    pub frame: Option<u8>,
    #[serde(default)]
    pub command: Option<u16>,
    #[serde(default)]
    pub param1: Option<f64>,
    #[serde(default)]
    pub param2: Option<f64>,
    #[serde(default)]
    pub param3: Option<f64>,
    #[serde(default)]
    pub param4: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub alt: Option<f64>,
    #[serde(default, rename = "autoContinue", deserialize_with = "opt_flag")]
    pub autocontinue: Option<bool>,
}

/// Field-level update applied to one waypoint of a mission file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointPatch {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub alt: Option<f64>,
    #[serde(default)]
    pub command: Option<u16>,
    #[serde(default)]
    pub frame: Option<u8>,
    #[serde(default)]
    pub param1: Option<f64>,
    #[serde(default)]
    pub param2: Option<f64>,
    #[serde(default)]
    pub param3: Option<f64>,
    #[serde(default)]
    pub param4: Option<f64>,
    #[serde(default, rename = "autoContinue", deserialize_with = "opt_flag")]
    pub autocontinue: Option<bool>,
    #[serde(default, deserialize_with = "opt_flag")]
    pub current: Option<bool>,
}

impl WaypointPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomePosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionMode {
    Auto,
    #[serde(alias = "man")]
    Manual,
}

impl std::str::FromStr for MissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "manual" | "man" => Ok(Self::Manual),
            other => Err(format!("unknown mission mode: {}", other)),
        }
    }
}

// Flags travel as 0/1 in files and older clients, as booleans elsewhere.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl From<Flag> for bool {
    fn from(f: Flag) -> bool {
        match f {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        }
    }
}

fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Flag::deserialize(d).map(bool::from)
}

fn opt_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(Option::<Flag>::deserialize(d)?.map(bool::from))
}
