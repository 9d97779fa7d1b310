//! Size-class classification used to pick images and placement.

use std::fmt;

use crate::provider::Architecture;

/// Families whose instances carry accelerators.
const GPU_FAMILIES: &[&str] = &[
    "p2", "p3", "p3dn", "p4d", "p4de", "p5", "p5e", "p5en", "g3", "g3s", "g4dn", "g4ad", "g5",
    "g5g", "g6", "g6e", "gr6", "trn1", "trn1n", "inf1", "inf2", "dl1",
];

/// Families that need a cluster placement group for their interconnect.
const TIGHT_NETWORKING_FAMILIES: &[&str] = &[
    "hpc6a", "hpc6id", "hpc7a", "hpc7g", "c5n", "c6gn", "c6in", "c7gn", "m5n", "m5dn", "r5n",
    "r5dn", "p4d", "p4de", "p5", "p5e", "trn1", "dl1",
];

/// Returns the family part of a size class (`c5n` for `c5n.18xlarge`).
#[must_use]
pub fn instance_family(instance_type: &str) -> &str {
    instance_type
        .split_once('.')
        .map_or(instance_type, |(family, _)| family)
}

/// Returns `true` when the size class belongs to the tight-networking
/// allow-list and so must be launched into a cluster placement group.
#[must_use]
pub fn requires_placement_group(instance_type: &str) -> bool {
    let family = instance_family(instance_type).to_ascii_lowercase();
    TIGHT_NETWORKING_FAMILIES.contains(&family.as_str())
}

/// Returns the CPU architecture implied by a size class. Graviton families
/// carry a `g` in the attribute letters after the generation digit.
#[must_use]
pub fn architecture_for(instance_type: &str) -> Architecture {
    let family = instance_family(instance_type).to_ascii_lowercase();
    if family == "a1" {
        return Architecture::Arm64;
    }
    let attributes = family
        .trim_start_matches(|ch: char| ch.is_ascii_alphabetic())
        .trim_start_matches(|ch: char| ch.is_ascii_digit());
    if attributes.contains('g') {
        Architecture::Arm64
    } else {
        Architecture::X86_64
    }
}

/// Image class of a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkloadClass {
    /// Needs accelerator drivers and `--gpus all`.
    Gpu,
    /// Plain compute.
    Cpu,
}

impl WorkloadClass {
    /// Classifies by size-class family, falling back to repository naming.
    #[must_use]
    pub fn classify(instance_type: &str, repository: &str) -> Self {
        let family = instance_family(instance_type).to_ascii_lowercase();
        let repo_name = repository.to_ascii_lowercase();
        if GPU_FAMILIES.contains(&family.as_str())
            || repo_name.contains("gpu")
            || repo_name.contains("cuda")
        {
            Self::Gpu
        } else {
            Self::Cpu
        }
    }

    /// Returns `true` for [`WorkloadClass::Gpu`].
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        matches!(self, Self::Gpu)
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gpu => "GPU",
            Self::Cpu => "CPU",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("hpc7a.96xlarge", true)]
    #[case("c5n.18xlarge", true)]
    #[case("p4d.24xlarge", true)]
    #[case("HPC6A.48XLARGE", true)]
    #[case("c5.large", false)]
    #[case("t3.micro", false)]
    #[case("g5.xlarge", false)]
    fn placement_allow_list(#[case] instance_type: &str, #[case] expected: bool) {
        assert_eq!(requires_placement_group(instance_type), expected);
    }

    #[rstest]
    #[case("c7g.large", Architecture::Arm64)]
    #[case("hpc7g.16xlarge", Architecture::Arm64)]
    #[case("c6gn.16xlarge", Architecture::Arm64)]
    #[case("g5g.xlarge", Architecture::Arm64)]
    #[case("a1.medium", Architecture::Arm64)]
    #[case("g5.xlarge", Architecture::X86_64)]
    #[case("c5n.18xlarge", Architecture::X86_64)]
    #[case("gr6.4xlarge", Architecture::X86_64)]
    #[case("t3.micro", Architecture::X86_64)]
    fn architecture_from_family(#[case] instance_type: &str, #[case] expected: Architecture) {
        assert_eq!(architecture_for(instance_type), expected);
    }

    #[rstest]
    #[case("g5.xlarge", "solver", WorkloadClass::Gpu)]
    #[case("p4d.24xlarge", "solver", WorkloadClass::Gpu)]
    #[case("c5.large", "solver-cuda", WorkloadClass::Gpu)]
    #[case("c5.large", "GPU-bench", WorkloadClass::Gpu)]
    #[case("c5.large", "solver", WorkloadClass::Cpu)]
    fn workload_classification(
        #[case] instance_type: &str,
        #[case] repository: &str,
        #[case] expected: WorkloadClass,
    ) {
        assert_eq!(WorkloadClass::classify(instance_type, repository), expected);
    }
}
