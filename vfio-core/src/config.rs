// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use serde::{Deserialize, Serialize};

use crate::host::IommuType;
use crate::{Result, VfioError};

/// When a DMA mapping that failed during steady state gets retried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapRetryPolicy {
    /// On the next topology transaction, whatever range it touches.
    #[default]
    AnyEvent,
    /// Only on a transaction touching a range that overlaps the failed one.
    TouchingRange,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VfioConfig {
    /// Allow region accesses through direct-map windows. When false every
    /// access traps into the host.
    #[serde(default = "default_true")]
    pub allow_mmap: bool,
    #[serde(default)]
    pub iommu: IommuType,
    #[serde(default = "default_true")]
    pub allow_kvm_intx: bool,
    #[serde(default = "default_true")]
    pub allow_kvm_msi: bool,
    #[serde(default = "default_true")]
    pub allow_kvm_msix: bool,
    #[serde(default)]
    pub map_retry: MapRetryPolicy,
}

impl Default for VfioConfig {
    fn default() -> Self {
        VfioConfig {
            allow_mmap: true,
            iommu: IommuType::default(),
            allow_kvm_intx: true,
            allow_kvm_msi: true,
            allow_kvm_msix: true,
            map_retry: MapRetryPolicy::default(),
        }
    }
}

impl VfioConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(VfioError::ConfigParse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(VfioConfig::from_json("{}").unwrap(), VfioConfig::default());
    }

    #[test]
    fn test_parse_config() {
        let config = VfioConfig::from_json(
            r#"{"allow_mmap": false, "iommu": "type1", "map_retry": "touching_range"}"#,
        )
        .unwrap();
        assert!(!config.allow_mmap);
        assert_eq!(config.iommu, IommuType::Type1);
        assert_eq!(config.map_retry, MapRetryPolicy::TouchingRange);
        assert!(config.allow_kvm_msix);
    }

    #[test]
    fn test_reject_unknown_fields() {
        assert!(matches!(
            VfioConfig::from_json(r#"{"allow_nmap": false}"#),
            Err(VfioError::ConfigParse(_))
        ));
        assert!(VfioConfig::from_json(r#"{"iommu": "spapr"}"#).is_err());
    }
}
