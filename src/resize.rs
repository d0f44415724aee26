use crate::{VmOpsError, Result, instance::Flavor, session::ProductVersion};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeDirection {
    /// Root disk grows or stays the same; the whole chain is copied.
    Up,
    /// Root disk shrinks; a resized copy of the root disk is sent instead.
    Down,
}

impl fmt::Display for ResizeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeDirection::Up => write!(f, "resizing up"),
            ResizeDirection::Down => write!(f, "resizing down"),
        }
    }
}

/// Decide whether a storage resize from `current` to `requested` can be done,
/// and which strategy moves the disks. Pure, no hypervisor access.
pub fn check_resize(current: Flavor, requested: Flavor) -> Result<ResizeDirection> {
    if requested.root_gb == 0 && current.root_gb != 0 {
        return Err(VmOpsError::Resize("Can't resize a disk to 0 GB.".to_string()));
    }

    if requested.ephemeral_gb < current.ephemeral_gb {
        return Err(VmOpsError::Unsupported(format!(
            "ephemeral disks cannot shrink ({} GB -> {} GB)",
            current.ephemeral_gb, requested.ephemeral_gb
        )));
    }

    if requested.root_gb < current.root_gb {
        // The shrink path only carries the root disk.
        if current.ephemeral_gb > 0 || requested.ephemeral_gb > 0 {
            return Err(VmOpsError::Unsupported(
                "resizing down instances with ephemeral disks".to_string(),
            ));
        }
        return Ok(ResizeDirection::Down);
    }

    Ok(ResizeDirection::Up)
}

/// Hypervisor call used to grow a disk on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFunc {
    Resize,
    ResizeOnline,
}

impl ResizeFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResizeFunc::Resize => "VDI.resize",
            ResizeFunc::ResizeOnline => "VDI.resize_online",
        }
    }

    /// Older XCP and XenServer releases only expose the online variant.
    pub fn for_product(brand: Option<&str>, version: Option<ProductVersion>) -> Self {
        let (Some(brand), Some(ProductVersion(major, minor, _))) = (brand, version) else {
            return ResizeFunc::Resize;
        };

        let xcp_1_2_or_above = (major == 1 && minor > 1) || major > 1;
        let xenserver_6_or_above = major > 5;

        match brand {
            "XCP" if !xcp_1_2_or_above => ResizeFunc::ResizeOnline,
            "XenServer" if !xenserver_6_or_above => ResizeFunc::ResizeOnline,
            _ => ResizeFunc::Resize,
        }
    }
}

impl fmt::Display for ResizeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_shrink_with_ephemeral_is_rejected() {
        let err = check_resize(Flavor::new(2, 1), Flavor::new(1, 1)).unwrap_err();
        assert!(matches!(err, VmOpsError::Unsupported(_)));
    }

    #[test]
    fn ephemeral_shrink_is_rejected_even_when_root_grows() {
        let err = check_resize(Flavor::new(1, 2), Flavor::new(4, 1)).unwrap_err();
        assert!(matches!(err, VmOpsError::Unsupported(_)));
    }

    #[test]
    fn ephemeral_growth_goes_up() {
        assert_eq!(
            check_resize(Flavor::new(1, 1), Flavor::new(1, 2)).unwrap(),
            ResizeDirection::Up
        );
    }

    #[test]
    fn root_shrink_without_ephemeral_goes_down() {
        assert_eq!(
            check_resize(Flavor::new(2, 0), Flavor::new(1, 0)).unwrap(),
            ResizeDirection::Down
        );
    }

    #[test]
    fn unchanged_allocation_goes_up() {
        assert_eq!(
            check_resize(Flavor::new(1, 1), Flavor::new(1, 1)).unwrap(),
            ResizeDirection::Up
        );
        assert_eq!(
            check_resize(Flavor::new(1, 1), Flavor::new(2, 1)).unwrap(),
            ResizeDirection::Up
        );
    }

    #[test]
    fn zero_root_is_refused() {
        let err = check_resize(Flavor::new(10, 0), Flavor::new(0, 0)).unwrap_err();
        assert!(matches!(err, VmOpsError::Resize(_)));
        // Diskless flavors stay diskless.
        assert!(check_resize(Flavor::new(0, 0), Flavor::new(0, 0)).is_ok());
    }

    #[test]
    fn resize_func_defaults_to_vdi_resize() {
        assert_eq!(ResizeFunc::for_product(None, None).as_str(), "VDI.resize");
        assert_eq!(
            ResizeFunc::for_product(Some("XenServer"), None),
            ResizeFunc::Resize
        );
    }

    #[test]
    fn resize_func_for_old_products() {
        assert_eq!(
            ResizeFunc::for_product(Some("XCP"), Some(ProductVersion(1, 1, 0))),
            ResizeFunc::ResizeOnline
        );
        assert_eq!(
            ResizeFunc::for_product(Some("XCP"), Some(ProductVersion(1, 2, 0))),
            ResizeFunc::Resize
        );
        assert_eq!(
            ResizeFunc::for_product(Some("XenServer"), Some(ProductVersion(5, 6, 100))),
            ResizeFunc::ResizeOnline
        );
        assert_eq!(
            ResizeFunc::for_product(Some("XenServer"), Some(ProductVersion(6, 0, 0))),
            ResizeFunc::Resize
        );
    }
}
