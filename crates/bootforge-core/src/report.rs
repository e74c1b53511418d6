//! Aggregated analysis record.

use crate::error::Result;
use crate::image::header::BootImageHeader;
use crate::image::{BootConfig, BootImageParser, ComponentKind, ParsedImage, ParserConfig, Provenance};
use crate::kernel::{AnalyzerConfig, KernelAnalyzer, KernelBinary};
use serde::Serialize;
use tracing::debug;

/// Presence, size and digest of one boot image segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSummary {
    /// Segment name
    pub kind: ComponentKind,
    /// Whether the image carries it
    pub present: bool,
    /// Size in bytes (0 when absent)
    pub size: usize,
    /// BLAKE3 digest, when present
    pub content_hash: Option<String>,
}

/// Configuration for [`analyze_boot_image`]
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Container parser limits
    pub parser: ParserConfig,
    /// Kernel analyzer limits
    pub analyzer: AnalyzerConfig,
    /// Run the kernel analyzer (disable for a container-only report)
    pub analyze_kernel: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            analyzer: AnalyzerConfig::default(),
            analyze_kernel: true,
        }
    }
}

impl ReportConfig {
    /// Creates a new report config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the parser configuration
    pub fn parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    /// Sets the analyzer configuration
    pub fn analyzer(mut self, analyzer: AnalyzerConfig) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Sets whether the kernel is analyzed
    pub fn analyze_kernel(mut self, analyze: bool) -> Self {
        self.analyze_kernel = analyze;
        self
    }
}

/// Everything known about one boot image, ready for serialization
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    /// Version of the library that produced the report
    pub tool_version: &'static str,
    /// How the components were located
    pub provenance: Provenance,
    /// Parser strategy that accepted the image
    pub strategy: &'static str,
    /// Decoded (or synthesized) header
    pub header: BootImageHeader,
    /// Values needed to rebuild the image
    pub boot_config: BootConfig,
    /// One entry per segment kind, in on-disk order
    pub components: Vec<ComponentSummary>,
    /// Kernel analysis, when it was run
    pub kernel: Option<KernelBinary>,
}

impl AnalysisReport {
    /// Summarize a parsed image (without kernel analysis)
    pub fn new(parsed: &ParsedImage) -> Self {
        let components = ComponentKind::ALL
            .into_iter()
            .map(|kind| match parsed.components.get(kind) {
                Some(data) => ComponentSummary {
                    kind,
                    present: true,
                    size: data.len(),
                    content_hash: Some(crate::content_hash(data)),
                },
                None => ComponentSummary {
                    kind,
                    present: false,
                    size: 0,
                    content_hash: None,
                },
            })
            .collect();

        Self {
            tool_version: crate::VERSION,
            provenance: parsed.provenance,
            strategy: parsed.strategy,
            header: parsed.header.clone(),
            boot_config: parsed.components.config().clone(),
            components,
            kernel: None,
        }
    }

    /// Attach the kernel analysis
    pub fn with_kernel(mut self, kernel: KernelBinary) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Summary of one segment
    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentSummary> {
        self.components.iter().find(|c| c.kind == kind)
    }

    /// Serialize to compact JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize to indented JSON
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Parse `raw` and analyze its kernel
pub fn analyze_boot_image(raw: &[u8], config: &ReportConfig) -> Result<AnalysisReport> {
    let parsed = BootImageParser::with_config(config.parser.clone()).parse(raw)?;
    let report = AnalysisReport::new(&parsed);
    if !config.analyze_kernel {
        return Ok(report);
    }

    debug!("Analyzing kernel from {} image", parsed.strategy);
    let kernel = KernelAnalyzer::with_config(config.analyzer.clone())
        .analyze_bytes(parsed.components.kernel().clone())?;
    Ok(report.with_kernel(kernel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BootImageBuilder;
    use crate::kernel::Architecture;
    use crate::Error;
    use pretty_assertions::assert_eq;

    fn sample_image() -> Vec<u8> {
        let mut kernel = vec![0u8; 0x40];
        kernel[0x38..0x3C].copy_from_slice(b"ARM\x64");
        kernel.extend_from_slice(b"Linux version 6.1.25-android14 (build@host) #1 SMP\n");

        let components = crate::image::ExtractedComponents::new(
            kernel,
            BootConfig::new().header_version(2).cmdline("console=ttyS0"),
        )
        .with_component(ComponentKind::Ramdisk, vec![0x30u8; 700]);
        BootImageBuilder::new().build(&components, None).unwrap().to_vec()
    }

    #[test]
    fn test_full_pipeline() {
        let report = analyze_boot_image(&sample_image(), &ReportConfig::default()).unwrap();

        assert_eq!(report.provenance, Provenance::Structured);
        assert_eq!(report.components.len(), 5);
        assert_eq!(report.component(ComponentKind::Ramdisk).map(|c| c.size), Some(700));
        assert_eq!(report.component(ComponentKind::Dtb).map(|c| c.present), Some(false));

        let kernel = report.kernel.as_ref().unwrap();
        assert_eq!(kernel.kernel_version.as_deref(), Some("6.1.25"));
        assert_eq!(kernel.architecture, Architecture::Arm64);
        assert_eq!(
            report.component(ComponentKind::Kernel).and_then(|c| c.content_hash.as_deref()),
            Some(kernel.content_hash.as_str())
        );
    }

    #[test]
    fn test_json_record() {
        let config = ReportConfig::new().analyze_kernel(false);
        let report = analyze_boot_image(&sample_image(), &config).unwrap();
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(json["provenance"], "structured");
        assert_eq!(json["strategy"], "structured");
        assert_eq!(json["header"]["magic"], "414e44524f494421");
        assert_eq!(json["boot_config"]["cmdline"], "console=ttyS0");
        assert_eq!(json["components"][1]["kind"], "ramdisk");
        assert!(json["kernel"].is_null());
    }

    #[test]
    fn test_kernel_ceiling_is_enforced() {
        let config = ReportConfig::new().analyzer(AnalyzerConfig::new().max_input_size(8));
        let err = analyze_boot_image(&sample_image(), &config).unwrap_err();
        assert!(matches!(err, Error::Resource { stage: "kernel analysis", .. }));
    }
}
