mod manifest;

pub use manifest::ParallaxManifest;
