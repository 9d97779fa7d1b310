//! Machine image resolution.

use tracing::info;

use crate::provider::{Architecture, ComputeApi, ImageInfo, ImageQuery};

use super::classify::{WorkloadClass, architecture_for};
use super::{EnsureError, ResourceEnsurer, provider_failure};

/// Boot device assumed when the provider omits one.
pub const DEFAULT_ROOT_DEVICE: &str = "/dev/xvda";

const IMAGE_OWNER: &str = "amazon";

/// Image chosen for a deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedImage {
    /// Image identifier.
    pub image_id: String,
    /// Device name of the boot volume, used for the size override.
    pub root_device_name: String,
    /// Workload class the image was resolved for.
    pub class: WorkloadClass,
    /// Architecture implied by the size class.
    pub architecture: Architecture,
}

impl ResolvedImage {
    fn from_info(info: ImageInfo, class: WorkloadClass, architecture: Architecture) -> Self {
        let root_device_name = if info.root_device_name.trim().is_empty() {
            DEFAULT_ROOT_DEVICE.to_owned()
        } else {
            info.root_device_name
        };
        Self {
            image_id: info.id,
            root_device_name,
            class,
            architecture,
        }
    }
}

/// Builds the latest-image lookup for a workload class and architecture.
#[must_use]
pub fn image_query(class: WorkloadClass, architecture: Architecture) -> ImageQuery {
    let name_pattern = match (class, architecture) {
        (WorkloadClass::Gpu, Architecture::X86_64) => {
            "Deep Learning Base OSS Nvidia Driver GPU AMI (Amazon Linux 2023) *".to_owned()
        }
        (WorkloadClass::Gpu, Architecture::Arm64) => {
            "Deep Learning ARM64 Base OSS Nvidia Driver GPU AMI (Amazon Linux 2023) *".to_owned()
        }
        (WorkloadClass::Cpu, arch) => format!("al2023-ami-2023.*-kernel-6.1-{arch}"),
    };
    ImageQuery {
        owner: IMAGE_OWNER.to_owned(),
        name_pattern,
        architecture,
    }
}

impl<P: ComputeApi + ?Sized> ResourceEnsurer<'_, P> {
    /// Resolves the machine image for a deployment. An explicit override is
    /// verified to exist; otherwise the newest image of the workload class
    /// for the size class architecture is looked up.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError::ImageNotFound`] for an unknown override,
    /// [`EnsureError::NoImageForClass`] when the lookup is empty, and
    /// [`EnsureError::Provider`] when the provider call fails.
    pub async fn resolve_image(
        &self,
        instance_type: &str,
        repository: &str,
        image_override: Option<&str>,
    ) -> Result<ResolvedImage, EnsureError> {
        let class = WorkloadClass::classify(instance_type, repository);
        let architecture = architecture_for(instance_type);

        if let Some(image_id) = image_override {
            let info = self
                .api
                .describe_image(image_id)
                .await
                .map_err(provider_failure("machine image", image_id, "read"))?
                .ok_or_else(|| EnsureError::ImageNotFound {
                    image_id: image_id.to_owned(),
                })?;
            info!(image_id, "using requested machine image");
            return Ok(ResolvedImage::from_info(info, class, architecture));
        }

        let query = image_query(class, architecture);
        let newest = self
            .api
            .find_images(&query)
            .await
            .map_err(provider_failure("machine image", &query.name_pattern, "look up"))?
            .into_iter()
            .max_by(|left, right| left.creation_date.cmp(&right.creation_date))
            .ok_or_else(|| EnsureError::NoImageForClass {
                class,
                architecture,
                pattern: query.name_pattern.clone(),
            })?;
        info!(
            image_id = %newest.id,
            image_name = %newest.name,
            %class,
            %architecture,
            "resolved latest machine image"
        );
        Ok(ResolvedImage::from_info(newest, class, architecture))
    }
}
