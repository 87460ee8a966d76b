use crate::profile::DeviceProfile;
use bstr::BString;

/// Public description of an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: BString,
    pub vendor: BString,
    pub model: BString,
    pub ty: BString,
}

impl Device {
    pub(crate) fn new(name: BString, profile: &DeviceProfile) -> Self {
        Device {
            name,
            vendor: profile.vendor.clone(),
            model: profile.model.clone(),
            ty: profile.ty.clone(),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'{name}' (vendor '{vendor}', model '{model}', type '{ty}')",
            name = self.name,
            vendor = self.vendor,
            model = self.model,
            ty = self.ty,
        )
    }
}
