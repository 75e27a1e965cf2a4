//! Local media ownership: capture devices, track lifecycle, and toggles.
//!
//! Capture itself is a platform concern reached through the [`MediaDevices`]
//! trait; everything above that seam — who owns which track, the exact
//! mute/video toggles, and the release-on-every-exit-path discipline — lives
//! here.

mod controller;
mod devices;
mod simulated;
mod track;

pub use controller::MediaController;
pub use devices::{MediaAcquisitionError, MediaDevices};
pub use simulated::SimulatedMediaDevices;
pub use track::{LocalStream, LocalTrack, RemoteTrack, TrackKind, TrackSource};
