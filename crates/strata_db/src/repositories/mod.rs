//! Concrete repositories built on [`crate::BaseRepository`].

pub mod device_registration;

pub use device_registration::{
    DeviceRegistration, DeviceRegistrationMapper, DeviceRegistrationRepository,
};
