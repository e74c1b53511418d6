//! # bootforge-core
//!
//! A library for taking Android boot images apart, looking inside their
//! kernels, and putting them back together.
//!
//! This crate provides the core functionality for:
//! - Splitting boot images (header versions 0 to 3) into their segments
//! - Recognizing and decompressing kernel payloads
//! - Fingerprinting kernels: version, architecture, embedded config,
//!   security features and notable strings
//! - Rebuilding boot images from (possibly modified) segments
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`image`]: Container parsing and rebuilding
//! - [`codec`]: Compression detection and decompression
//! - [`kernel`]: Kernel analysis
//! - [`features`]: Feature classification of the embedded config
//! - [`report`]: The aggregated analysis record
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use bootforge_core::{analyze_boot_image, BootImageBuilder, BootImageParser, ReportConfig};
//! use bootforge_core::image::ComponentKind;
//! use std::fs;
//!
//! let data = fs::read("boot.img")?;
//!
//! // Full analysis as JSON
//! let report = analyze_boot_image(&data, &ReportConfig::default())?;
//! println!("{}", report.to_json_pretty()?);
//!
//! // Swap the kernel and rebuild
//! let parsed = BootImageParser::new().parse(&data)?;
//! let kernel = fs::read("Image.gz")?;
//! let components = parsed.components.with_component(ComponentKind::Kernel, kernel);
//! let image = BootImageBuilder::new().build(&components, None)?;
//! fs::write("boot-new.img", &image)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`ParseStrategy`]: Recognize additional container formats
//! - [`ConfigFeatureClassifier::with_rules`]: Classify with a custom dictionary
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod codec;
pub mod error;
pub mod features;
pub mod image;
pub mod kernel;
pub mod report;

// Re-export primary types for convenience
pub use codec::CompressionKind;
pub use error::{Error, Result};
pub use features::{ConfigFeatureClassifier, FeatureCategory, FeatureLists};
pub use image::{
    parse_file, BootConfig, BootImageBuilder, BootImageParser, ExtractedComponents, ParseStrategy,
    ParsedImage, ParserConfig, Provenance,
};
pub use kernel::{AnalyzerConfig, KernelAnalyzer, KernelBinary};
pub use report::{analyze_boot_image, AnalysisReport, ReportConfig};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// BLAKE3 digest of `data` as lowercase hex
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
