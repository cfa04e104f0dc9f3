//! OCI documents, repository references and registry transport.

pub mod image;
pub mod reference;
pub mod registry;

pub use image::{
    artifact_manifest, build_arch_image, build_index, ArchImage, Blob, CONFIG_MEDIA_TYPE,
    INDEX_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
};
pub use reference::{parse_pinned, Repository};
pub use registry::{MemoryRegistry, OciRegistry, RegistryAuth, RegistryTransport};
