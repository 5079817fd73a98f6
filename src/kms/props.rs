use std::{fmt, marker::PhantomData};

use drm::control::property;
use tracing::trace;

use super::device::{KmsDevice, ObjectId};
use super::error::Error;

const MAX_PROPS: usize = 12;

/// A table of property names the display model cares about for one object type
pub trait PropertyName: Copy + fmt::Debug + 'static {
    /// All names, indexed by [`PropertyName::index`]
    const NAMES: &'static [&'static str];

    /// Position of this property in [`PropertyName::NAMES`]
    fn index(self) -> usize;

    /// Name as exposed by the driver
    fn name(self) -> &'static str {
        Self::NAMES[self.index()]
    }
}

/// Plane properties
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneProp {
    SrcX,
    SrcY,
    SrcW,
    SrcH,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    FbId,
    CrtcId,
    Type,
    Rotation,
}

impl PropertyName for PlaneProp {
    const NAMES: &'static [&'static str] = &[
        "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "FB_ID", "CRTC_ID", "type",
        "rotation",
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// CRTC properties
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtcProp {
    Background,
    Ctm,
    DegammaLut,
    GammaLut,
    ModeId,
    Active,
}

impl PropertyName for CrtcProp {
    const NAMES: &'static [&'static str] = &[
        "background_color",
        "CTM",
        "DEGAMMA_LUT",
        "GAMMA_LUT",
        "MODE_ID",
        "ACTIVE",
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Connector properties
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorProp {
    ScalingMode,
    CrtcId,
}

impl PropertyName for ConnectorProp {
    const NAMES: &'static [&'static str] = &["scaling mode", "CRTC_ID"];

    fn index(self) -> usize {
        self as usize
    }
}

/// Property handles of one KMS object, looked up once by name
///
/// Properties the driver does not expose stay absent. The cache has to be filled again
/// if the object is destroyed and recreated, since property ids are not stable across
/// object lifetimes.
pub struct PropertyCache<P> {
    handles: [Option<property::Handle>; MAX_PROPS],
    values: [u64; MAX_PROPS],
    _names: PhantomData<P>,
}

impl<P: PropertyName> fmt::Debug for PropertyCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, handle) in P::NAMES.iter().zip(self.handles.iter()) {
            if let Some(handle) = handle {
                map.entry(name, handle);
            }
        }
        map.finish()
    }
}

impl<P> Clone for PropertyCache<P> {
    fn clone(&self) -> Self {
        PropertyCache {
            handles: self.handles,
            values: self.values,
            _names: PhantomData,
        }
    }
}

impl<P: PropertyName> Default for PropertyCache<P> {
    fn default() -> Self {
        PropertyCache {
            handles: [None; MAX_PROPS],
            values: [0; MAX_PROPS],
            _names: PhantomData,
        }
    }
}

impl<P: PropertyName> PropertyCache<P> {
    /// Enumerates the properties of `object` and records the ones named by `P`
    ///
    /// A failing enumeration is a protocol error: the object was handed out by the driver
    /// itself, so its properties must be readable.
    #[profiling::function]
    pub fn fill(dev: &dyn KmsDevice, object: ObjectId) -> Result<Self, Error> {
        let props = dev.properties(object).map_err(|source| Error::Access {
            errmsg: "Failed to get properties of object",
            dev: dev.dev_path(),
            source,
        })?;

        let mut cache = PropertyCache::default();
        for prop in props {
            if let Some(idx) = P::NAMES.iter().position(|name| *name == prop.name) {
                trace!(?object, name = P::NAMES[idx], handle = ?prop.handle, "mapped property");
                cache.handles[idx] = Some(prop.handle);
                cache.values[idx] = prop.value;
            }
        }
        Ok(cache)
    }

    /// Handle of a property, if the driver exposes it
    pub fn get(&self, prop: P) -> Option<property::Handle> {
        self.handles[prop.index()]
    }

    /// Whether the driver exposes the property
    pub fn has(&self, prop: P) -> bool {
        self.get(prop).is_some()
    }

    /// Value the property had when the cache was filled
    pub fn initial_value(&self, prop: P) -> u64 {
        self.values[prop.index()]
    }

    /// Handle of a property the caller cannot do without
    pub fn require(&self, prop: P, object: ObjectId) -> Result<property::Handle, Error> {
        self.get(prop).ok_or(Error::UnknownProperty {
            object,
            name: prop.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectorProp, CrtcProp, PlaneProp, PropertyCache, PropertyName};
    use crate::kms::{
        device::{mock::MockDevice, KmsDevice, ObjectId},
        MockConfig,
    };

    #[test]
    fn tables_are_consistent() {
        assert_eq!(PlaneProp::NAMES.len(), PlaneProp::Rotation.index() + 1);
        assert_eq!(CrtcProp::NAMES.len(), CrtcProp::Active.index() + 1);
        assert_eq!(ConnectorProp::NAMES.len(), ConnectorProp::CrtcId.index() + 1);
        assert_eq!(PlaneProp::CrtcId.name(), "CRTC_ID");
        assert_eq!(ConnectorProp::ScalingMode.name(), "scaling mode");
    }

    #[test]
    fn fill_maps_known_names() {
        let dev = MockDevice::new(MockConfig::default());
        let res = dev.resources().unwrap();

        let plane = PropertyCache::<PlaneProp>::fill(&dev, ObjectId::Plane(res.planes[0])).unwrap();
        assert!(plane.has(PlaneProp::FbId));
        assert!(plane.has(PlaneProp::Type));
        let crtc = PropertyCache::<CrtcProp>::fill(&dev, ObjectId::Crtc(res.crtcs[0])).unwrap();
        assert!(crtc.has(CrtcProp::ModeId));
        assert!(crtc.get(CrtcProp::Background).is_none());
        assert!(crtc
            .require(CrtcProp::Background, ObjectId::Crtc(res.crtcs[0]))
            .is_err());
    }
}
