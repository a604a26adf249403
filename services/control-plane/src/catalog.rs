//! Game type catalog: which image and internal port a `game_type` runs as.
//!
//! Parsed from `KILN_GAME_IMAGES`, a comma separated list of
//! `game=image[:tag]:port` entries. The port is always the last
//! colon-separated segment, so tagged images parse unambiguously.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{ControlPlaneError, ControlPlaneResult};

pub const DEFAULT_GAME_IMAGES: &str = "minecraft=itzg/minecraft-server:latest:25565";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameImage {
    pub image: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameCatalog {
    games: BTreeMap<String, GameImage>,
}

impl GameCatalog {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut games = BTreeMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, rest) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("game entry '{entry}' is missing '='"))?;
            let (image, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("game entry '{entry}' is missing a port"))?;
            let container_port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("game entry '{entry}' has invalid port '{port}'"))?;
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || image.trim().is_empty() {
                anyhow::bail!("game entry '{entry}' is incomplete");
            }
            games.insert(
                name,
                GameImage {
                    image: image.trim().to_string(),
                    container_port,
                },
            );
        }
        if games.is_empty() {
            anyhow::bail!("game catalog is empty");
        }
        Ok(Self { games })
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Look up a game type. Unknown types are a validation error.
    pub fn resolve(&self, game_type: &str) -> ControlPlaneResult<&GameImage> {
        self.games
            .get(&game_type.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                let known: Vec<&str> = self.games.keys().map(String::as_str).collect();
                ControlPlaneError::Validation(format!(
                    "unknown game type '{game_type}' (known: {})",
                    known.join(", ")
                ))
            })
    }
}

impl Default for GameCatalog {
    fn default() -> Self {
        let mut games = BTreeMap::new();
        games.insert(
            "minecraft".to_string(),
            GameImage {
                image: "itzg/minecraft-server:latest".to_string(),
                container_port: 25565,
            },
        );
        Self { games }
    }
}
