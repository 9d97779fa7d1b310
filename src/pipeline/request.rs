//! Deployment parameters and their validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::is_account_id;

/// Largest boot volume the provider accepts, in GiB.
pub const MAX_VOLUME_SIZE_GB: u32 = 16_384;

/// Boot volume types accepted by the provider.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// General purpose SSD, previous generation.
    Gp2,
    /// General purpose SSD.
    #[default]
    Gp3,
    /// Provisioned IOPS SSD.
    Io1,
    /// Provisioned IOPS SSD, newer generation.
    Io2,
    /// Throughput optimised HDD.
    St1,
    /// Cold HDD.
    Sc1,
    /// Magnetic.
    Standard,
}

impl VolumeType {
    /// Provider spelling of the volume type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gp2 => "gp2",
            Self::Gp3 => "gp3",
            Self::Io1 => "io1",
            Self::Io2 => "io2",
            Self::St1 => "st1",
            Self::Sc1 => "sc1",
            Self::Standard => "standard",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeType {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gp2" => Ok(Self::Gp2),
            "gp3" => Ok(Self::Gp3),
            "io1" => Ok(Self::Io1),
            "io2" => Ok(Self::Io2),
            "st1" => Ok(Self::St1),
            "sc1" => Ok(Self::Sc1),
            "standard" => Ok(Self::Standard),
            _ => Err(RequestError::VolumeType(value.trim().to_owned())),
        }
    }
}

/// Errors raised for malformed deployment requests.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// A required field is blank.
    #[error("missing or empty field: {0}")]
    Missing(&'static str),
    /// The account identifier is not twelve digits.
    #[error("account identifier `{0}` must be exactly 12 digits")]
    AccountId(String),
    /// The boot volume size is out of range.
    #[error("volume size {0} GiB must be between 1 and {MAX_VOLUME_SIZE_GB}")]
    VolumeSize(u32),
    /// The boot volume type is unknown.
    #[error("unknown volume type `{0}`; expected gp2, gp3, io1, io2, st1, sc1 or standard")]
    VolumeType(String),
}

/// Immutable input to one pipeline run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentRequest {
    /// Target region, for example `us-east-2`.
    pub region: String,
    /// Account that owns the registry repository.
    pub account_id: String,
    /// Registry repository holding the workload image.
    pub repository: String,
    /// Instance size class.
    pub instance_type: String,
    /// Boot volume size in GiB.
    pub volume_size_gb: u32,
    /// Boot volume type.
    pub volume_type: VolumeType,
    /// Requested availability zone.
    pub availability_zone: Option<String>,
    /// Requested subnet.
    pub subnet_id: Option<String>,
    /// Machine image override.
    pub image_id: Option<String>,
    /// Plain-text user data script.
    pub user_data: Option<String>,
    /// Write the region into the instance's CLI configuration.
    pub configure_credentials: bool,
}

impl DeploymentRequest {
    /// Starts a builder for a [`DeploymentRequest`].
    #[must_use]
    pub fn builder() -> DeploymentRequestBuilder {
        DeploymentRequestBuilder::new()
    }

    /// Checks every invariant of the request.
    ///
    /// # Errors
    ///
    /// Returns the first [`RequestError`] found.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.region.is_empty() {
            return Err(RequestError::Missing("region"));
        }
        if !is_account_id(&self.account_id) {
            return Err(RequestError::AccountId(self.account_id.clone()));
        }
        if self.repository.is_empty() {
            return Err(RequestError::Missing("repository"));
        }
        if self.instance_type.is_empty() {
            return Err(RequestError::Missing("instance_type"));
        }
        if !(1..=MAX_VOLUME_SIZE_GB).contains(&self.volume_size_gb) {
            return Err(RequestError::VolumeSize(self.volume_size_gb));
        }
        Ok(())
    }

    /// Registry host serving the account's repositories in the region.
    #[must_use]
    pub fn registry_host(&self) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", self.account_id, self.region)
    }
}

/// Builder for [`DeploymentRequest`] that trims inputs and validates on
/// [`build`](Self::build).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentRequestBuilder {
    region: String,
    account_id: String,
    repository: String,
    instance_type: String,
    volume_size_gb: u32,
    volume_type: VolumeType,
    availability_zone: Option<String>,
    subnet_id: Option<String>,
    image_id: Option<String>,
    user_data: Option<String>,
    configure_credentials: bool,
}

impl Default for DeploymentRequestBuilder {
    fn default() -> Self {
        Self {
            region: String::new(),
            account_id: String::new(),
            repository: String::new(),
            instance_type: String::new(),
            volume_size_gb: 30,
            volume_type: VolumeType::default(),
            availability_zone: None,
            subnet_id: None,
            image_id: None,
            user_data: None,
            configure_credentials: false,
        }
    }
}

/// Trims an optional value, mapping blank input to `None`.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|trimmed| !trimmed.is_empty())
}

impl DeploymentRequestBuilder {
    /// Creates a builder with a 30 GiB gp3 boot volume.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the account identifier.
    #[must_use]
    pub fn account_id(mut self, value: impl Into<String>) -> Self {
        self.account_id = value.into();
        self
    }

    /// Sets the registry repository.
    #[must_use]
    pub fn repository(mut self, value: impl Into<String>) -> Self {
        self.repository = value.into();
        self
    }

    /// Sets the instance size class.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the boot volume size in GiB.
    #[must_use]
    pub const fn volume_size_gb(mut self, value: u32) -> Self {
        self.volume_size_gb = value;
        self
    }

    /// Sets the boot volume type.
    #[must_use]
    pub const fn volume_type(mut self, value: VolumeType) -> Self {
        self.volume_type = value;
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn availability_zone(mut self, value: Option<String>) -> Self {
        self.availability_zone = value;
        self
    }

    /// Sets the subnet.
    #[must_use]
    pub fn subnet_id(mut self, value: Option<String>) -> Self {
        self.subnet_id = value;
        self
    }

    /// Sets the machine image override.
    #[must_use]
    pub fn image_id(mut self, value: Option<String>) -> Self {
        self.image_id = value;
        self
    }

    /// Sets the user data script.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Enables the credential configuration step.
    #[must_use]
    pub const fn configure_credentials(mut self, value: bool) -> Self {
        self.configure_credentials = value;
        self
    }

    /// Builds and validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when a field is blank or out of range.
    pub fn build(self) -> Result<DeploymentRequest, RequestError> {
        let request = DeploymentRequest {
            region: self.region.trim().to_owned(),
            account_id: self.account_id.trim().to_owned(),
            repository: self.repository.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            volume_size_gb: self.volume_size_gb,
            volume_type: self.volume_type,
            availability_zone: non_blank(self.availability_zone),
            subnet_id: non_blank(self.subnet_id),
            image_id: non_blank(self.image_id),
            // Scripts keep their whitespace; only blank scripts are dropped.
            user_data: self.user_data.filter(|script| !script.trim().is_empty()),
            configure_credentials: self.configure_credentials,
        };
        request.validate()?;
        Ok(request)
    }
}
