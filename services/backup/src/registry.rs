use crate::config::{Config, InstanceConfig};
use crate::error::BackupError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Cloud vendor an environment is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Aliyun,
    Aws,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aliyun => "aliyun",
            Provider::Aws => "aws",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only mapping of environment names to database instances.
///
/// Built once from [`Config`] at startup and shared by reference afterwards.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    aliyun: HashMap<String, InstanceConfig>,
    aws: HashMap<String, InstanceConfig>,
}

impl InstanceRegistry {
    pub fn new(
        aliyun: HashMap<String, InstanceConfig>,
        aws: HashMap<String, InstanceConfig>,
    ) -> Self {
        Self { aliyun, aws }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.aliyun.instances.clone(), config.aws.instances.clone())
    }

    fn instances(&self, provider: Provider) -> &HashMap<String, InstanceConfig> {
        match provider {
            Provider::Aliyun => &self.aliyun,
            Provider::Aws => &self.aws,
        }
    }

    /// Resolve an environment, rejecting names that are not configured
    pub fn lookup(&self, environment: &str, provider: Provider) -> Result<&InstanceConfig, BackupError> {
        self.instances(provider)
            .get(environment)
            .ok_or_else(|| BackupError::UnknownEnvironment {
                provider,
                environment: environment.to_string(),
            })
    }

    /// Sorted environment names for a provider
    pub fn environments(&self, provider: Provider) -> Vec<String> {
        let mut names: Vec<String> = self.instances(provider).keys().cloned().collect();
        names.sort();
        names
    }

    /// Distinct regions of all AWS instances
    pub fn aws_regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self
            .aws
            .values()
            .map(|instance| instance.region.clone())
            .filter(|region| !region.is_empty())
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }
}
