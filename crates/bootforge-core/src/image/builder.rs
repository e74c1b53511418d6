//! Boot image reconstruction.
//!
//! The builder is the inverse of [`StructuredParser`](super::StructuredParser):
//! it lays segments out with the same page alignment the parser expects, so
//! parsing a built image returns the header values and segment bytes that went
//! in. Padding is always zero-filled.

use super::header::{
    cmdline_capacity, cmdline_fits, layout_size, version_supports, BootImageHeader, NAME_SIZE,
};
use super::{BootConfig, ComponentKind, ExtractedComponents};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

/// Segment sizes a caller expects the build to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentSizes {
    /// Kernel size
    pub kernel: u64,
    /// Ramdisk size (0 when absent)
    pub ramdisk: u64,
    /// Second stage size (0 when absent)
    pub second: u64,
    /// Recovery DTBO size (0 when absent)
    pub recovery_dtbo: u64,
    /// Device tree blob size (0 when absent)
    pub dtb: u64,
}

impl SegmentSizes {
    /// Actual sizes of a component set
    pub fn of(components: &ExtractedComponents) -> Self {
        let len = |kind| components.get(kind).map_or(0, |data| data.len() as u64);
        Self {
            kernel: len(ComponentKind::Kernel),
            ramdisk: len(ComponentKind::Ramdisk),
            second: len(ComponentKind::Second),
            recovery_dtbo: len(ComponentKind::RecoveryDtbo),
            dtb: len(ComponentKind::Dtb),
        }
    }

    /// Size recorded for `kind`
    pub fn get(&self, kind: ComponentKind) -> u64 {
        match kind {
            ComponentKind::Kernel => self.kernel,
            ComponentKind::Ramdisk => self.ramdisk,
            ComponentKind::Second => self.second,
            ComponentKind::RecoveryDtbo => self.recovery_dtbo,
            ComponentKind::Dtb => self.dtb,
        }
    }
}

/// Options for [`BootImageBuilder::build_with`]
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Fail unless the supplied bytes have exactly these sizes
    pub declared_sizes: Option<SegmentSizes>,
}

impl BuildOptions {
    /// Creates default build options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sizes the supplied segments must match
    pub fn declared_sizes(mut self, sizes: SegmentSizes) -> Self {
        self.declared_sizes = Some(sizes);
        self
    }
}

/// Assembles boot images from component sets
#[derive(Debug, Clone, Copy, Default)]
pub struct BootImageBuilder;

impl BootImageBuilder {
    /// Creates a new builder
    pub fn new() -> Self {
        Self
    }

    /// Build an image from `components`.
    ///
    /// `overrides` replaces the boot config carried by the components. Segment
    /// sizes always come from the byte lengths actually supplied.
    pub fn build(
        &self,
        components: &ExtractedComponents,
        overrides: Option<&BootConfig>,
    ) -> Result<Bytes> {
        self.build_with(components, overrides, &BuildOptions::default())
    }

    /// Build an image with extra validation options
    pub fn build_with(
        &self,
        components: &ExtractedComponents,
        overrides: Option<&BootConfig>,
        options: &BuildOptions,
    ) -> Result<Bytes> {
        let config = match overrides {
            Some(config) => config.clone().normalized(),
            None => components.config().clone(),
        };
        let header = self.plan_header(components, &config, options)?;
        let layout = header.layout();

        let total_len = usize::try_from(layout.total_len)
            .map_err(|_| Error::validation("layout", "image does not fit in memory"))?;
        let mut image = BytesMut::with_capacity(total_len);
        image.extend_from_slice(&header.encode());

        for span in &layout.spans {
            let data = components.component(span.kind)?;
            trace!("{} segment at {:#x}, {} bytes", span.kind, span.offset, data.len());
            image.resize(span.offset as usize, 0);
            image.extend_from_slice(data);
        }
        image.resize(total_len, 0);

        debug!(
            "Built v{} boot image: {} bytes, {} segments",
            header.header_version,
            image.len(),
            layout.spans.len()
        );
        Ok(image.freeze())
    }

    /// Validate the inputs and produce the header to write
    fn plan_header(
        &self,
        components: &ExtractedComponents,
        config: &BootConfig,
        options: &BuildOptions,
    ) -> Result<BootImageHeader> {
        let version = config.header_version;
        let header_size = layout_size(version).ok_or_else(|| {
            Error::validation("header", format!("unsupported header version {}", version))
        })?;

        if components.kernel().is_empty() {
            return Err(Error::validation("kernel", "kernel image is empty"));
        }

        let page_size = config.page_size;
        if !page_size.is_power_of_two() {
            return Err(Error::validation(
                "header",
                format!("page size {} is not a power of two", page_size),
            ));
        }

        if config.name.len() > NAME_SIZE {
            return Err(Error::validation(
                "header",
                format!("product name is {} bytes, at most {} fit", config.name.len(), NAME_SIZE),
            ));
        }
        if !cmdline_fits(version, &config.cmdline) {
            return Err(Error::validation(
                "header",
                format!(
                    "command line is {} bytes, header v{} holds {}",
                    config.cmdline.len(),
                    version,
                    cmdline_capacity(version)
                ),
            ));
        }
        if config.cmdline.contains('\0') {
            return Err(Error::validation("header", "command line contains a NUL byte"));
        }

        let sizes = SegmentSizes::of(components);
        for kind in ComponentKind::ALL {
            let size = sizes.get(kind);
            if size > 0 && !version_supports(version, kind) {
                return Err(Error::validation(
                    "layout",
                    format!("header v{} cannot carry a {} segment", version, kind),
                ));
            }
            if size > u64::from(u32::MAX) {
                return Err(Error::validation(
                    "layout",
                    format!("{} segment of {} bytes overflows its size field", kind, size),
                ));
            }
        }
        if let Some(declared) = &options.declared_sizes {
            for kind in ComponentKind::ALL {
                if declared.get(kind) != sizes.get(kind) {
                    return Err(Error::validation(
                        "sizes",
                        format!(
                            "{} declared as {} bytes but {} bytes were supplied",
                            kind,
                            declared.get(kind),
                            sizes.get(kind)
                        ),
                    ));
                }
            }
        }

        let mut header = BootImageHeader {
            header_version: version,
            page_size,
            header_size: header_size as u32,
            kernel_size: sizes.kernel as u32,
            ramdisk_size: sizes.ramdisk as u32,
            os_version: config.os_version,
            cmdline: config.cmdline.clone(),
            ..BootImageHeader::empty(version)
        };

        if version >= 3 {
            return Ok(header);
        }

        header.kernel_addr = config.kernel_addr;
        header.ramdisk_addr = config.ramdisk_addr;
        header.second_size = sizes.second as u32;
        header.second_addr = config.second_addr;
        header.tags_addr = config.tags_addr;
        header.name = config.name.clone();
        header.id = config.id;
        header.recovery_dtbo_size = sizes.recovery_dtbo as u32;
        if version >= 2 {
            header.dtb_size = sizes.dtb as u32;
            header.dtb_addr = config.dtb_addr;
        }

        header.recovery_dtbo_offset = header
            .layout()
            .spans
            .iter()
            .find(|span| span.kind == ComponentKind::RecoveryDtbo)
            .map_or(0, |span| span.offset);

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::header::V3_PAGE_SIZE;
    use crate::image::{BootImageParser, Provenance};
    use pretty_assertions::assert_eq;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn config(version: u32) -> BootConfig {
        let mut config = BootConfig::new()
            .header_version(version)
            .cmdline("console=ttyMSM0,115200n8 androidboot.hardware=qcom")
            .name("bootforge");
        config.os_version = (14 << 25) | (24 << 4) | 3;
        config.id[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        config
    }

    #[test]
    fn test_round_trip_v2_all_segments() {
        let components = ExtractedComponents::new(pattern(5000, 1), config(2))
            .with_component(ComponentKind::Ramdisk, pattern(3000, 2))
            .with_component(ComponentKind::Second, pattern(100, 3))
            .with_component(ComponentKind::RecoveryDtbo, pattern(200, 4))
            .with_component(ComponentKind::Dtb, pattern(300, 5));

        let image = BootImageBuilder::new().build(&components, None).unwrap();
        let parsed = BootImageParser::new().parse_bytes(image.clone()).unwrap();

        assert_eq!(parsed.provenance, Provenance::Structured);
        assert_eq!(parsed.components, components);
        assert_eq!(parsed.header.kernel_size, 5000);
        assert_eq!(parsed.header.dtb_size, 300);
        // header page + kernel (3 pages) + ramdisk (2) + second + dtbo + dtb
        assert_eq!(parsed.header.recovery_dtbo_offset, 2048 * 7);
        assert_eq!(image.len(), 2048 * 9);
    }

    #[test]
    fn test_round_trip_v0_and_v1() {
        for version in [0, 1] {
            let components = ExtractedComponents::new(pattern(4096, 7), config(version).page_size(4096))
                .with_component(ComponentKind::Ramdisk, pattern(10, 8));

            let image = BootImageBuilder::new().build(&components, None).unwrap();
            let parsed = BootImageParser::new().parse(&image).unwrap();

            assert_eq!(parsed.components, components, "header v{}", version);
            assert_eq!(parsed.header.page_size, 4096);
            assert_eq!(image.len(), 4096 * 3);
        }
    }

    #[test]
    fn test_round_trip_v3() {
        let components = ExtractedComponents::new(pattern(9000, 9), config(3).page_size(2048))
            .with_component(ComponentKind::Ramdisk, pattern(5000, 10));

        let image = BootImageBuilder::new().build(&components, None).unwrap();
        let parsed = BootImageParser::new().parse(&image).unwrap();

        assert_eq!(parsed.header.page_size, V3_PAGE_SIZE);
        assert_eq!(parsed.header.header_version, 3);
        assert_eq!(parsed.header.os_version, components.config().os_version);
        assert_eq!(parsed.components, components);
        assert_eq!(components.config().name, "");
    }

    #[test]
    fn test_overrides_replace_carried_config() {
        let components = ExtractedComponents::new(pattern(100, 1), config(0));
        let overrides = config(1).cmdline("init=/sbin/init");

        let image = BootImageBuilder::new().build(&components, Some(&overrides)).unwrap();
        let parsed = BootImageParser::new().parse(&image).unwrap();

        assert_eq!(parsed.components.config(), &overrides.normalized());
    }

    #[test]
    fn test_round_trip_default_config() {
        for version in 0..=3 {
            let components = ExtractedComponents::new(
                pattern(300, 3),
                BootConfig::default().header_version(version),
            );

            let image = BootImageBuilder::new().build(&components, None).unwrap();
            let parsed = BootImageParser::new().parse(&image).unwrap();

            assert_eq!(parsed.components, components, "header v{}", version);
        }
    }

    #[test]
    fn test_round_trip_multibyte_cmdline_at_field_boundary() {
        for cmdline in ["a".repeat(511) + "é", "b".repeat(510) + "€ androidboot.mode=charger"] {
            let components =
                ExtractedComponents::new(pattern(64, 1), config(2).cmdline(cmdline.clone()));

            let image = BootImageBuilder::new().build(&components, None).unwrap();
            let parsed = BootImageParser::new().parse(&image).unwrap();

            assert_eq!(parsed.components.config().cmdline, cmdline);
        }
    }

    #[test]
    fn test_replaced_kernel_is_resized() {
        let components = ExtractedComponents::new(pattern(100, 1), config(2));
        let image = BootImageBuilder::new().build(&components, None).unwrap();
        let parsed = BootImageParser::new().parse(&image).unwrap();

        let replaced = parsed.components.with_component(ComponentKind::Kernel, pattern(7000, 2));
        let rebuilt = BootImageBuilder::new().build(&replaced, None).unwrap();
        let reparsed = BootImageParser::new().parse(&rebuilt).unwrap();

        assert_eq!(reparsed.header.kernel_size, 7000);
        assert_eq!(reparsed.components.kernel().as_ref(), &pattern(7000, 2)[..]);
    }

    #[test]
    fn test_validation_failures() {
        let builder = BootImageBuilder::new();
        let kernel = pattern(64, 0);
        let reject = |components: ExtractedComponents, stage: &str| {
            let err = builder.build(&components, None).unwrap_err();
            match err {
                Error::Validation { stage: got, .. } => assert_eq!(got, stage),
                other => panic!("expected validation error, got {}", other),
            }
        };

        reject(ExtractedComponents::new(Vec::<u8>::new(), config(0)), "kernel");
        reject(ExtractedComponents::new(kernel.clone(), config(0).page_size(3000)), "header");
        reject(ExtractedComponents::new(kernel.clone(), config(0).page_size(0)), "header");
        reject(ExtractedComponents::new(kernel.clone(), config(4)), "header");
        reject(ExtractedComponents::new(kernel.clone(), config(0).name("x".repeat(17))), "header");
        reject(
            ExtractedComponents::new(kernel.clone(), config(0).cmdline("y".repeat(1536))),
            "header",
        );
        reject(
            ExtractedComponents::new(kernel.clone(), config(1))
                .with_component(ComponentKind::Dtb, pattern(8, 0)),
            "layout",
        );
        reject(
            ExtractedComponents::new(kernel.clone(), config(0))
                .with_component(ComponentKind::RecoveryDtbo, pattern(8, 0)),
            "layout",
        );
        reject(
            ExtractedComponents::new(kernel, config(3))
                .with_component(ComponentKind::Second, pattern(8, 0)),
            "layout",
        );
    }

    #[test]
    fn test_declared_sizes_must_match() {
        let components = ExtractedComponents::new(pattern(64, 0), config(0));
        let mut declared = SegmentSizes::of(&components);
        assert!(BootImageBuilder::new()
            .build_with(&components, None, &BuildOptions::new().declared_sizes(declared))
            .is_ok());

        declared.kernel = 65;
        let err = BootImageBuilder::new()
            .build_with(&components, None, &BuildOptions::new().declared_sizes(declared))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { stage: "sizes", .. }));
    }
}
