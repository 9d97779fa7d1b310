//! Configuration loading via `ortho-config`.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::aws::{AwsSettings, DEFAULT_AWS_BIN};
use crate::pipeline::{DeploymentRequestBuilder, ResourceNames, VolumeType};
use crate::trust::TrustSettings;

/// Settings shared by every skiff command, merged from defaults,
/// `skiff.toml`, and `SKIFF_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SKIFF",
    discovery(
        app_name = "skiff",
        env_var = "SKIFF_CONFIG_PATH",
        config_file_name = "skiff.toml",
        dotfile_name = ".skiff.toml",
        project_file_name = "skiff.toml"
    )
)]
pub struct SkiffConfig {
    /// Path or name of the `aws` client.
    #[ortho_config(default = DEFAULT_AWS_BIN.to_owned())]
    pub aws_bin: String,
    /// Named profile holding the deployment service credentials.
    pub profile: Option<String>,
    /// Region used for trust verification and as the deployment default.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Execution role attached to instances.
    #[ortho_config(default = "skiff-instance-role".to_owned())]
    pub instance_role_name: String,
    /// Instance profile carrying the execution role.
    #[ortho_config(default = "skiff-instance-profile".to_owned())]
    pub instance_profile_name: String,
    /// Outbound-only security group.
    #[ortho_config(default = "skiff-egress-only".to_owned())]
    pub security_group_name: String,
    /// Placement group for tight-networking size classes.
    #[ortho_config(default = "skiff-cluster".to_owned())]
    pub placement_group_name: String,
    /// Role deployed into customer accounts by the trust template.
    #[ortho_config(default = "SkiffDeployerRole".to_owned())]
    pub trust_role_name: String,
    /// External identifier required by the customer role's trust policy.
    pub external_id: Option<String>,
    /// Principal customer roles are expected to trust.
    pub trust_principal_arn: Option<String>,
    /// Boot volume size in GiB.
    #[ortho_config(default = 30)]
    pub default_volume_size_gb: u32,
    /// Boot volume type.
    #[ortho_config(default = "gp3".to_owned())]
    pub default_volume_type: String,
}

/// Metadata for a configuration field, used in actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to skiff.toml",
            self.env_var, self.toml_key
        )
    }
}

impl SkiffConfig {
    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("skiff")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Checks required fields and the volume defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::InvalidValue`] for unusable volume defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.aws_bin,
                FieldMetadata::new("aws client path", "SKIFF_AWS_BIN", "aws_bin"),
            ),
            (
                &self.region,
                FieldMetadata::new("region", "SKIFF_REGION", "region"),
            ),
            (
                &self.instance_role_name,
                FieldMetadata::new(
                    "instance role name",
                    "SKIFF_INSTANCE_ROLE_NAME",
                    "instance_role_name",
                ),
            ),
            (
                &self.instance_profile_name,
                FieldMetadata::new(
                    "instance profile name",
                    "SKIFF_INSTANCE_PROFILE_NAME",
                    "instance_profile_name",
                ),
            ),
            (
                &self.security_group_name,
                FieldMetadata::new(
                    "security group name",
                    "SKIFF_SECURITY_GROUP_NAME",
                    "security_group_name",
                ),
            ),
            (
                &self.placement_group_name,
                FieldMetadata::new(
                    "placement group name",
                    "SKIFF_PLACEMENT_GROUP_NAME",
                    "placement_group_name",
                ),
            ),
            (
                &self.trust_role_name,
                FieldMetadata::new("trust role name", "SKIFF_TRUST_ROLE_NAME", "trust_role_name"),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        let size = FieldMetadata::new(
            "volume size",
            "SKIFF_DEFAULT_VOLUME_SIZE_GB",
            "default_volume_size_gb",
        );
        if self.default_volume_size_gb == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be at least 1 GiB: {}",
                size.description,
                size.hint()
            )));
        }
        self.volume_type()?;
        Ok(())
    }

    /// Parsed boot volume type.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unknown volume types.
    pub fn volume_type(&self) -> Result<VolumeType, ConfigError> {
        let metadata = FieldMetadata::new(
            "volume type",
            "SKIFF_DEFAULT_VOLUME_TYPE",
            "default_volume_type",
        );
        self.default_volume_type
            .parse()
            .map_err(|err| ConfigError::InvalidValue(format!("{err}: {}", metadata.hint())))
    }

    /// Settings of the `aws` client acting as the deployment service.
    #[must_use]
    pub fn aws_settings(&self) -> AwsSettings {
        AwsSettings {
            bin: self.aws_bin.trim().to_owned(),
            region: self.region.trim().to_owned(),
            profile: self.profile.clone().filter(|value| !value.trim().is_empty()),
        }
    }

    /// Names of the shared resources every deployment ensures.
    #[must_use]
    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames {
            instance_role: self.instance_role_name.clone(),
            instance_profile: self.instance_profile_name.clone(),
            security_group: self.security_group_name.clone(),
            placement_group: self.placement_group_name.clone(),
        }
    }

    /// Trust verification settings for the configured region.
    #[must_use]
    pub fn trust_settings(&self) -> TrustSettings {
        TrustSettings {
            external_id: self.external_id.clone(),
            trust_principal_arn: self.trust_principal_arn.clone(),
            ..TrustSettings::new(self.region.trim())
        }
    }

    /// Request builder preloaded with the configured region and volume
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the volume type is unknown.
    pub fn request_builder(&self) -> Result<DeploymentRequestBuilder, ConfigError> {
        Ok(DeploymentRequestBuilder::new()
            .region(self.region.trim())
            .volume_size_gb(self.default_volume_size_gb)
            .volume_type(self.volume_type()?))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A configuration field holds an unusable value.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// The `ortho-config` loader failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> SkiffConfig {
        SkiffConfig {
            aws_bin: String::from("aws"),
            profile: None,
            region: String::from("eu-west-1"),
            instance_role_name: String::from("skiff-instance-role"),
            instance_profile_name: String::from("skiff-instance-profile"),
            security_group_name: String::from("skiff-egress-only"),
            placement_group_name: String::from("skiff-cluster"),
            trust_role_name: String::from("SkiffDeployerRole"),
            external_id: Some(String::from("ext-1")),
            trust_principal_arn: None,
            default_volume_size_gb: 50,
            default_volume_type: String::from("io2"),
        }
    }

    #[rstest]
    fn valid_config_passes(config: SkiffConfig) {
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    fn blank_region_names_env_var_and_key(mut config: SkiffConfig) {
        config.region = String::from("  ");

        let message = config.validate().expect_err("region required").to_string();

        assert!(message.contains("SKIFF_REGION"), "{message}");
        assert!(message.contains("region"), "{message}");
        assert!(message.contains("skiff.toml"), "{message}");
    }

    #[rstest]
    fn unknown_volume_type_is_invalid(mut config: SkiffConfig) {
        config.default_volume_type = String::from("nvme");

        let err = config.validate().expect_err("bad volume type");

        assert!(matches!(
            err,
            ConfigError::InvalidValue(ref message) if message.contains("SKIFF_DEFAULT_VOLUME_TYPE")
        ));
    }

    #[rstest]
    fn zero_volume_size_is_invalid(mut config: SkiffConfig) {
        config.default_volume_size_gb = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[rstest]
    fn derived_settings_follow_config(config: SkiffConfig) {
        let names = config.resource_names();
        assert_eq!(names.security_group, "skiff-egress-only");

        let trust = config.trust_settings();
        assert_eq!(trust.region, "eu-west-1");
        assert_eq!(trust.external_id.as_deref(), Some("ext-1"));

        let request = config
            .request_builder()
            .expect("builder")
            .account_id("123456789012")
            .repository("solver")
            .instance_type("c5.large")
            .build()
            .expect("request");
        assert_eq!(request.region, "eu-west-1");
        assert_eq!(request.volume_size_gb, 50);
        assert_eq!(request.volume_type, VolumeType::Io2);
    }

    #[rstest]
    fn blank_profile_is_ignored(mut config: SkiffConfig) {
        config.profile = Some(String::from(" "));
        assert_eq!(config.aws_settings().profile, None);
    }
}
