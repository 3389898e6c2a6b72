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
    pub agent_service_name: String,
    pub agent_service_namespace: String,
    pub namespaces: NamespaceConfig,
    pub logging: LoggingConfig,
    pub tls: TlsConfig,
    pub agent_tls: TlsConfig,
}

#[derive(Debug)]
pub struct NamespaceConfig {
    /// If non-empty, requests for namespaces outside this set are rejected.
    pub allow_list: Vec<String>,
    /// Resolved for a caller that did not specify any namespace.
    pub default: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ConfigInternal {
    #[serde(rename(deserialize = "addr"))]
    address: String,
    #[serde(rename(deserialize = "agent-service-name"))]
    agent_service_name: String,
    #[serde(rename(deserialize = "agent-service-namespace"))]
    agent_service_namespace: String,
    #[serde(rename(deserialize = "namespaces"), default)]
    namespaces: NamespaceConfigInternal,
    logging: LoggingConfig,
    tls: TlsConfig,
    #[serde(rename(deserialize = "agent-tls"), default)]
    agent_tls: TlsConfig,
}

#[derive(Deserialize, Debug, Default)]
struct NamespaceConfigInternal {
    #[serde(rename(deserialize = "allow-list"), default)]
    allow_list: Vec<String>,
    default: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FullConfig {
    aggregator: ConfigInternal,
}

#[derive(Deserialize, Debug)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: String,
    pub format: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename(deserialize = "cert-file"), default)]
    pub cert_file: Option<PathBuf>,

    #[serde(rename(deserialize = "key-file"), default)]
    pub key_file: Option<PathBuf>,

    #[serde(rename(deserialize = "ca-file"), default)]
    pub ca_file: Option<PathBuf>,

    /// One of `none | request | require-any | verify-if-given | require-and-verify`.
    #[serde(rename(deserialize = "client-auth"), default)]
    pub client_auth: Option<String>,
}

impl Config {
    pub async fn parse(
        path: &Path,
        overrides: Vec<(String, String)>,
    ) -> Result<Self, Box<dyn Error + 'static>> {
        let mut builder = Self::builder_with_defaults()?
            .add_source(config::File::with_name(&path.to_string_lossy()));

        for (name, value) in overrides {
            builder = builder.set_override(format!("aggregator.{name}"), value)?;
        }

        let full_config: FullConfig = builder.build()?.try_deserialize()?;
        let agent = full_config.aggregator;

        Self::validate_tls(&agent.tls)?;
        Self::validate_tls(&agent.agent_tls)?;

        Ok(Self {
            address: Self::parse_address(&agent.address)?,
            agent_service_name: agent.agent_service_name,
            agent_service_namespace: agent.agent_service_namespace,
            namespaces: NamespaceConfig {
                allow_list: agent.namespaces.allow_list,
                default: agent.namespaces.default,
            },
            logging: agent.logging,
            tls: agent.tls,
            agent_tls: agent.agent_tls,
        })
    }

    fn validate_tls(tls: &TlsConfig) -> Result<(), Box<dyn Error + 'static>> {
        if !tls.enabled {
            return Ok(());
        }

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

        Ok(())
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
            .set_default("aggregator.addr", "[::]:50052")?
            .set_default("aggregator.agent-service-name", "kubetail-agent")?
            .set_default("aggregator.agent-service-namespace", "kubetail-system")?
            .set_default("aggregator.logging.enabled", true)?
            .set_default("aggregator.logging.level", "info")?
            .set_default("aggregator.logging.format", "json")?
            .set_default("aggregator.tls.enabled", false)?
            .set_default("aggregator.agent-tls.enabled", false)
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
            "aggregator:\n  addr: \":50053\"\n  agent-service-name: my-agents\n  agent-service-namespace: ns1\n  logging:\n    enabled: true\n    level: debug\n    format: pretty\n  tls:\n    enabled: false\n"
        )
        .unwrap();

        let config = Config::parse(file.path(), Vec::new()).await.unwrap();
        assert_eq!(config.address, "[::]:50053".parse().unwrap());
        assert_eq!(config.agent_service_name, "my-agents");
        assert!(config.namespaces.allow_list.is_empty());
    }

    #[tokio::test]
    async fn namespace_allow_list_and_default_round_trip() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "aggregator:\n  addr: \":50053\"\n  agent-service-name: my-agents\n  agent-service-namespace: ns1\n  namespaces:\n    allow-list: [\"a\", \"b\"]\n    default: a\n  logging:\n    enabled: true\n    level: info\n    format: json\n  tls:\n    enabled: false\n"
        )
        .unwrap();

        let config = Config::parse(file.path(), Vec::new()).await.unwrap();
        assert_eq!(config.namespaces.allow_list, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(config.namespaces.default.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn rejects_tls_without_cert_files() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "aggregator:\n  addr: \":50053\"\n  agent-service-name: my-agents\n  agent-service-namespace: ns1\n  logging:\n    enabled: true\n    level: info\n    format: json\n  tls:\n    enabled: true\n"
        )
        .unwrap();

        let result = Config::parse(file.path(), Vec::new()).await;
        assert!(result.is_err());
    }
}
