//! Property-based tests for configuration module
//!
//! These tests use proptest to generate random configurations and verify
//! invariants, serialization round-trips, and edge case handling.

use super::*;
use proptest::prelude::*;

fn any_format() -> impl Strategy<Value = PixelFormat> {
    prop_oneof![
        Just(PixelFormat::Argb8888),
        Just(PixelFormat::Xrgb8888),
        Just(PixelFormat::Abgr8888),
        Just(PixelFormat::Xbgr8888),
        Just(PixelFormat::Rgb565),
    ]
}

fn any_orientation() -> impl Strategy<Value = Orientation> {
    prop_oneof![
        Just(Orientation::Normal),
        Just(Orientation::Left),
        Just(Orientation::Inverted),
        Just(Orientation::Right),
    ]
}

// Strategy for generating valid pool configurations
prop_compose! {
    fn valid_pool_config()(
        ring_depth in 1usize..=MAX_RING_DEPTH,
        format in any_format(),
    ) -> PoolConfig {
        PoolConfig { ring_depth, format }
    }
}

// Strategy for generating valid headless outputs
prop_compose! {
    fn valid_output_config()(
        x in -4096i32..4096,
        y in -4096i32..4096,
        width in 1u32..8192,
        height in 1u32..8192,
        orientation in any_orientation(),
        self_rotating in any::<bool>(),
        bypass in any::<bool>(),
    ) -> OutputConfig {
        OutputConfig {
            name: String::new(),
            kind: OutputKind::Headless,
            x,
            y,
            width,
            height,
            orientation,
            self_rotating,
            bypass,
        }
    }
}

// Strategy for generating complete valid configurations
prop_compose! {
    fn valid_graphics_config()(
        pool in valid_pool_config(),
        outputs in prop::collection::vec(valid_output_config(), 1..4),
        debug in any::<bool>(),
        frames in 0u32..1000,
    ) -> GraphicsConfig {
        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(i, output)| OutputConfig { name: format!("OUT-{i}"), ..output })
            .collect();
        GraphicsConfig {
            platform: PlatformConfig::default(),
            pool,
            outputs,
            general: GeneralConfig { debug, frames },
        }
    }
}

proptest! {
    #[test]
    fn prop_valid_configs_pass_validation(config in valid_graphics_config()) {
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn prop_toml_roundtrip_preserves_config(config in valid_graphics_config()) {
        let toml_string = toml::to_string(&config).unwrap();
        let parsed: GraphicsConfig = toml::from_str(&toml_string).unwrap();
        prop_assert_eq!(parsed, config);
    }

    #[test]
    fn prop_out_of_range_ring_depth_is_rejected(
        config in valid_graphics_config(),
        ring_depth in prop_oneof![Just(0usize), (MAX_RING_DEPTH + 1)..64usize],
    ) {
        let mut config = config;
        config.pool.ring_depth = ring_depth;
        prop_assert!(config.validate().is_err());
    }

    #[test]
    fn prop_zero_dimension_is_rejected(
        config in valid_graphics_config(),
        zero_width in any::<bool>(),
    ) {
        let mut config = config;
        if zero_width {
            config.outputs[0].width = 0;
        } else {
            config.outputs[0].height = 0;
        }
        prop_assert!(config.validate().is_err());
    }

    #[test]
    fn prop_merge_with_default_is_identity(config in valid_graphics_config()) {
        let merged = config.clone().merge_partial(GraphicsConfig::default());
        prop_assert_eq!(merged, config);
    }
}
