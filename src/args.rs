// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::Parser;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tracing::Level;

use crate::config;
use crate::config::SerializableLevel;
use crate::prelude::*;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PrismdConfig {
    // Not useful to put into a config file.
    #[serde(skip_serializing)]
    pub config_file: PathBuf,
    pub endpoint: String,
    pub framerate: u32,
    pub screen_width: i32,
    pub screen_height: i32,
    pub log_file: Option<PathBuf>,
    pub stderr_log_level: SerializableLevel,
    pub file_log_level: SerializableLevel,
}

impl Default for PrismdConfig {
    fn default() -> Self {
        Self {
            config_file: config::default_config_file("prismd"),
            endpoint: format!("unix:{}", config::default_socket_path().display()),
            framerate: 60,
            screen_width: 1280,
            screen_height: 720,
            log_file: None,
            stderr_log_level: SerializableLevel(Level::INFO),
            file_log_level: SerializableLevel(Level::DEBUG),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "prismd", about = "prism display server")]
pub struct PrismdArgs {
    /// Print a configuration file with default values to stdout and exit.
    /// Convenient for generating a new config file by redirecting stdout to
    /// the config file location.
    #[arg(long)]
    pub print_default_config_and_exit: bool,

    /// Path to the config file. Defaults to $XDG_CONFIG_HOME/prism/prismd.ron
    /// with ~/.config and /etc fallbacks.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Listening endpoint: unix:PATH or tcp:IP:PORT.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Target composition rate in frames per second.
    #[arg(long)]
    pub framerate: Option<u32>,

    #[arg(long)]
    pub screen_width: Option<i32>,

    #[arg(long)]
    pub screen_height: Option<i32>,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long)]
    pub stderr_log_level: Option<SerializableLevel>,

    #[arg(long)]
    pub file_log_level: Option<SerializableLevel>,
}

/// Defaults, overlaid with the config file, overlaid with command-line flags.
pub fn init_config() -> Result<PrismdConfig> {
    let args = PrismdArgs::parse();

    // Handled before parsing the config file so a broken config file doesn't
    // prevent printing a new one to replace it.
    if args.print_default_config_and_exit {
        config::print_default_config_and_exit::<PrismdConfig>();
    }

    let mut config = PrismdConfig::default();
    let config_file = args.config_file.clone().unwrap_or(config.config_file.clone());
    if let Some(from_file) = config::maybe_read_ron_file::<PrismdConfig>(&config_file)
        .location(loc!())?
    {
        config = from_file;
        config.config_file = config_file;
    }

    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(framerate) = args.framerate {
        config.framerate = framerate;
    }
    if let Some(width) = args.screen_width {
        config.screen_width = width;
    }
    if let Some(height) = args.screen_height {
        config.screen_height = height;
    }
    if let Some(log_file) = args.log_file {
        config.log_file = Some(log_file);
    }
    if let Some(level) = args.stderr_log_level {
        config.stderr_log_level = level;
    }
    if let Some(level) = args.file_log_level {
        config.file_log_level = level;
    }

    info!("running config: {config:#?}");
    Ok(config)
}
