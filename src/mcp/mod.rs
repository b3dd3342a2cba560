pub mod capability;
pub mod client;

pub use capability::{
    CapabilityClient, CapabilityConnector, CapabilityError, CapabilityMode, ChildIo,
};
pub use client::StdioClient;
