//! Well-known per-frame data kinds and their one-time registration.
//!
//! Kinds are split into a public range, shared with applications, and a
//! private range appended after it for data exchanged only between internal
//! pipeline stages. [`KindTable::register_all`] registers every kind at start
//! up and remembers the id each one was assigned.

use std::sync::Arc;

use crate::{Descriptor, DescriptorId, DescriptorRegistry, Result};

/// Statically known kinds of per-frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownKind {
    Exposure,
    WhiteBalance,
    Focus,
    Faces,
    Histogram,
    AlgorithmState,
    ReprocessSettings,
}

impl WellKnownKind {
    pub const PUBLIC: [WellKnownKind; 5] = [
        Self::Exposure,
        Self::WhiteBalance,
        Self::Focus,
        Self::Faces,
        Self::Histogram,
    ];

    pub const PRIVATE: [WellKnownKind; 2] = [Self::AlgorithmState, Self::ReprocessSettings];

    /// Every kind, public range first.
    pub const ALL: [WellKnownKind; 7] = [
        Self::Exposure,
        Self::WhiteBalance,
        Self::Focus,
        Self::Faces,
        Self::Histogram,
        Self::AlgorithmState,
        Self::ReprocessSettings,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_private(self) -> bool {
        matches!(self, Self::AlgorithmState | Self::ReprocessSettings)
    }

    /// Registered descriptor name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exposure => "frame.exposure",
            Self::WhiteBalance => "frame.white_balance",
            Self::Focus => "frame.focus",
            Self::Faces => "frame.faces",
            Self::Histogram => "frame.histogram",
            Self::AlgorithmState => "internal.algorithm_state",
            Self::ReprocessSettings => "internal.reprocess_settings",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Exposure => "exposure time and gains applied to the frame",
            Self::WhiteBalance => "per-channel white balance gains",
            Self::Focus => "lens position when the frame was captured",
            Self::Faces => "detected face rectangles",
            Self::Histogram => "luma histogram of the frame",
            Self::AlgorithmState => "opaque state carried between control algorithm runs",
            Self::ReprocessSettings => "settings for reprocessing a previously captured frame",
        }
    }

    fn descriptor(self) -> Result<Arc<Descriptor>> {
        let (name, description) = (self.name(), self.description());
        match self {
            Self::Exposure => Descriptor::for_type::<ExposureInfo>(name, description),
            Self::WhiteBalance => Descriptor::for_type::<WhiteBalanceGains>(name, description),
            Self::Focus => Descriptor::for_type::<FocusPosition>(name, description),
            Self::Faces => Descriptor::for_type::<FaceRegions>(name, description),
            Self::Histogram => Descriptor::for_type::<Histogram>(name, description),
            Self::AlgorithmState => Descriptor::for_type::<AlgorithmState>(name, description),
            Self::ReprocessSettings => {
                Descriptor::for_type::<ReprocessSettings>(name, description)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureInfo {
    pub exposure_time_us: u32,
    pub analog_gain: f32,
    pub digital_gain: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhiteBalanceGains {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusPosition {
    pub position: u32,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceRegion {
    pub bounds: Rect,
    /// Detection confidence, 0-100.
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FaceRegions {
    pub faces: Vec<FaceRegion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Histogram {
    pub bins: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlgorithmState {
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprocessSettings {
    pub source_frame: u64,
    pub crop: Option<Rect>,
}

/// Binding from each [`WellKnownKind`] to the descriptor registered for it.
#[derive(Debug)]
pub struct KindTable {
    descriptors: Vec<Arc<Descriptor>>,
}

impl KindTable {
    /// Registers every well-known kind with `registry`.
    ///
    /// If one registration fails, the kinds registered so far are
    /// unregistered again before the error is returned.
    pub fn register_all(registry: &DescriptorRegistry) -> Result<Self> {
        let mut descriptors = Vec::with_capacity(WellKnownKind::ALL.len());
        for kind in WellKnownKind::ALL {
            let registered = kind
                .descriptor()
                .and_then(|descriptor| registry.register(&descriptor).map(|_| descriptor));
            match registered {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => {
                    for descriptor in &descriptors {
                        if let Err(err) = registry.unregister(descriptor) {
                            tracing::warn!(
                                name = ?descriptor.name(),
                                error = %err,
                                "failed to roll back well-known kind registration"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(kinds = descriptors.len(), "well-known kinds registered");
        Ok(Self { descriptors })
    }

    pub fn id(&self, kind: WellKnownKind) -> DescriptorId {
        self.descriptors[kind.index()].id()
    }

    pub fn descriptor(&self, kind: WellKnownKind) -> &Arc<Descriptor> {
        &self.descriptors[kind.index()]
    }

    pub fn kind_of(&self, id: DescriptorId) -> Option<WellKnownKind> {
        WellKnownKind::ALL
            .into_iter()
            .find(|kind| self.id(*kind) == id && id.is_valid())
    }

    pub fn iter(&self) -> impl Iterator<Item = (WellKnownKind, DescriptorId)> + '_ {
        WellKnownKind::ALL
            .into_iter()
            .map(move |kind| (kind, self.id(kind)))
    }

    /// Unregisters and destroys every well-known descriptor.
    pub fn unregister_all(self, registry: &DescriptorRegistry) -> Result<()> {
        for descriptor in self.descriptors {
            registry.unregister(&descriptor)?;
            descriptor.destroy();
        }
        Ok(())
    }
}
