// Packed Vulkan API version with ordering and dotted display

use ash::vk;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ApiVersion(pub u32);

impl ApiVersion {
    pub const V1_0: Self = Self(vk::API_VERSION_1_0);
    pub const V1_1: Self = Self(vk::API_VERSION_1_1);
    pub const V1_2: Self = Self(vk::API_VERSION_1_2);
    pub const V1_3: Self = Self(vk::API_VERSION_1_3);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn major(self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// Same version with the patch component dropped
    pub fn without_patch(self) -> Self {
        Self::new(self.major(), self.minor(), 0)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

impl From<u32> for ApiVersion {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_components() {
        assert!(ApiVersion::V1_0 < ApiVersion::V1_1);
        assert!(ApiVersion::new(1, 2, 190) < ApiVersion::V1_3);
        assert_eq!(ApiVersion::new(1, 3, 0), ApiVersion::V1_3);
        assert_eq!(ApiVersion::new(1, 2, 7).without_patch(), ApiVersion::V1_2);
        assert_eq!(ApiVersion::new(1, 3, 250).to_string(), "1.3.250");
    }
}
