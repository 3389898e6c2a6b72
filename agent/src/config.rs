// Copyright 2024 The Kubetail Authors
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

use std::{
    error::Error,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use config::builder::DefaultState;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    pub address: SocketAddr,
    pub logs_dir: PathBuf,
    pub logging: LoggingConfig,
    pub tls: TlsConfig,
}

#[derive(Deserialize, Debug)]
struct ConfigInternal {
    #[serde(rename(deserialize = "addr"))]
    address: String,
    #[serde(rename(deserialize = "container-logs-dir"))]
    logs_dir: PathBuf,
    logging: LoggingConfig,
    tls: TlsConfig,
}

#[derive(Deserialize, Debug)]
struct FullConfig {
    agent: ConfigInternal,
}

#[derive(Deserialize, Debug)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: String,
    pub format: String,
}

#[derive(Deserialize, Debug)]
pub struct TlsConfig {
    pub enabled: bool,

    #[serde(rename(deserialize = "cert-file"))]
    pub cert_file: Option<PathBuf>,

    #[serde(rename(deserialize = "key-file"))]
    pub key_file: Option<PathBuf>,

    #[serde(rename(deserialize = "ca-file"))]
    pub ca_file: Option<PathBuf>,

    /// One of `none | request | require-any | verify-if-given | require-and-verify`.
    #[serde(rename(deserialize = "client-auth"))]
    pub client_auth: Option<String>,
}

impl Config {
    /// Loads configuration from `path`, then applies `overrides` (`-p
    /// name:value` CLI pairs) on top of the file source.
    pub async fn parse(
        path: &Path,
        overrides: Vec<(String, String)>,
    ) -> Result<Self, Box<dyn Error + 'static>> {
        let mut builder = Self::builder_with_defaults()?
            .add_source(config::File::with_name(&path.to_string_lossy()));

        for (name, value) in overrides {
            builder = builder.set_override(format!("agent.{name}"), value)?;
        }

        let full_config: FullConfig = builder.build()?.try_deserialize()?;
        let tls = full_config.agent.tls;

        if tls.enabled {
            if tls.cert_file.is_none() || tls.key_file.is_none() {
                return Err(Box::new(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cert file and key file should be supplied when tls is enabled",
                )));
            }

            if matches!(tls.client_auth.as_deref(), Some("require-and-verify" | "verify-if-given"))
                && tls.ca_file.is_none()
            {
                return Err(Box::new(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "a trusted CA bundle is required for this client-auth policy",
                )));
            }
        }

        Ok(Self {
            address: Self::parse_address(&full_config.agent.address)?,
            logs_dir: full_config.agent.logs_dir,
            logging: full_config.agent.logging,
            tls,
        })
    }

    fn parse_address(address: &str) -> Result<SocketAddr, Box<dyn Error + 'static>> {
        let shorthand_regex = Regex::new(r"^:(?<socket>\d+)$").unwrap();

        if let Some(captures) = shorthand_regex.captures(address) {
            let socket_str = format!("[::]:{}", &captures["socket"]);
            return Ok(socket_str.parse()?);
        }

        Ok(address.parse()?)
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("agent.addr", "[::]:50051")?
            .set_default("agent.container-logs-dir", "/var/log/containers")?
            .set_default("agent.logging.enabled", true)?
            .set_default("agent.logging.level", "info")?
            .set_default("agent.logging.format", "json")?
            .set_default("agent.tls.enabled", false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn parses_minimal_config_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "agent:\n  addr: \":50052\"\n  container-logs-dir: /tmp/logs\n  logging:\n    enabled: true\n    level: debug\n    format: pretty\n  tls:\n    enabled: false\n"
        )
        .unwrap();

        let config = Config::parse(file.path(), Vec::new()).await.unwrap();
        assert_eq!(config.address, "[::]:50052".parse().unwrap());
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(config.logging.level, "debug");
    }

    #[tokio::test]
    async fn overrides_apply_on_top_of_the_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "agent:\n  addr: \":50052\"\n  container-logs-dir: /tmp/logs\n  logging:\n    enabled: true\n    level: info\n    format: json\n  tls:\n    enabled: false\n"
        )
        .unwrap();

        let overrides = vec![("logging.level".to_owned(), "warn".to_owned())];
        let config = Config::parse(file.path(), overrides).await.unwrap();
        assert_eq!(config.logging.level, "warn");
    }

    #[tokio::test]
    async fn rejects_tls_without_cert_files() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "agent:\n  addr: \":50052\"\n  container-logs-dir: /tmp/logs\n  logging:\n    enabled: true\n    level: info\n    format: json\n  tls:\n    enabled: true\n"
        )
        .unwrap();

        let result = Config::parse(file.path(), Vec::new()).await;
        assert!(result.is_err());
    }
}
