// tests/test_negotiation.rs - Instance negotiation and tiered requirements.
//
// Everything here runs on `GlobalCapabilities` snapshots, so no driver or
// loader is needed.

use vk_provision::backend::instance::{
    platform_surface_extensions, ConnectionBuilder, ConnectionInfo, Diagnostics, DEBUG_UTILS_EXTENSION,
    PORTABILITY_ENUMERATION_EXTENSION, PROPERTIES2_EXTENSION, SURFACE_EXTENSION, VALIDATION_LAYER,
};
use vk_provision::backend::{ApiVersion, CapabilityKind, Error, ErrorKind, GlobalCapabilities, RingSettings, SelectionCriteria};

fn loader(version: ApiVersion, extensions: &[&str], layers: &[&str]) -> GlobalCapabilities {
    GlobalCapabilities::new(version, extensions.iter().copied(), layers.iter().copied())
}

fn windowed_loader(version: ApiVersion) -> GlobalCapabilities {
    loader(version, &[SURFACE_EXTENSION, platform_surface_extensions()[0]], &[])
}

#[test]
fn required_never_exceeds_requested_on_any_axis() {
    let builder = ConnectionBuilder::new("tiers")
        .require_api_version(ApiVersion::V1_3)
        .request_api_version(ApiVersion::V1_1);
    let version = builder.api_version();
    assert_eq!(version.required(), ApiVersion::V1_1);
    assert_eq!(version.requested(), ApiVersion::V1_1);

    let mut criteria = SelectionCriteria::default();
    criteria.memory.request(1 << 20);
    criteria.memory.require(1 << 30);
    assert_eq!(criteria.memory.required(), 1 << 30);
    assert_eq!(criteria.memory.requested(), 1 << 30);

    let mut settings = RingSettings::default();
    settings.image_count.require(4);
    settings.image_count.request(2);
    assert_eq!(settings.image_count.required(), 2);
    assert_eq!(settings.image_count.requested(), 2);
}

#[test]
fn version_falls_back_to_what_the_loader_offers() {
    let plan = ConnectionBuilder::new("fallback")
        .headless(true)
        .require_api_version(ApiVersion::V1_1)
        .request_api_version(ApiVersion::V1_3)
        .negotiate(&loader(ApiVersion::new(1, 2, 198), &[], &[]))
        .unwrap();
    assert_eq!(plan.api_version, ApiVersion::new(1, 2, 198));
}

#[test]
fn version_below_required_is_rejected() {
    let err = ConnectionBuilder::new("old loader")
        .headless(true)
        .require_api_version(ApiVersion::V1_2)
        .negotiate(&loader(ApiVersion::V1_1, &[], &[]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
}

#[test]
fn headless_plan_leaves_presentation_disabled() {
    let available = windowed_loader(ApiVersion::V1_3);

    let headless = ConnectionBuilder::new("demo").headless(true).negotiate(&available).unwrap();
    let info = ConnectionInfo::from_plan("demo", &headless);
    assert_eq!(info.presentation_extensions(), (false, false));

    let windowed = ConnectionBuilder::new("demo").negotiate(&available).unwrap();
    let info = ConnectionInfo::from_plan("demo", &windowed);
    assert_eq!(info.presentation_extensions(), (true, true));
}

#[test]
fn windowed_plan_needs_a_platform_extension() {
    let err = ConnectionBuilder::new("no platform")
        .negotiate(&loader(ApiVersion::V1_3, &[SURFACE_EXTENSION], &[]))
        .unwrap_err();
    match err {
        Error::MissingCapability { kind, .. } => assert_eq!(kind, CapabilityKind::Extension),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn requested_items_only_cost_optimality() {
    let plan = ConnectionBuilder::new("optional")
        .headless(true)
        .request_extension("VK_EXT_not_real")
        .request_layer("VK_LAYER_not_real")
        .negotiate(&loader(ApiVersion::V1_3, &[], &[]))
        .unwrap();
    assert!(plan.extensions.is_empty());
    assert!(plan.layers.is_empty());
    assert!(!plan.optimal);
}

#[test]
fn diagnostics_need_both_layer_and_messenger() {
    let partial = loader(ApiVersion::V1_3, &[DEBUG_UTILS_EXTENSION], &[]);

    let plan = ConnectionBuilder::new("debug")
        .headless(true)
        .diagnostics(Diagnostics::Requested)
        .negotiate(&partial)
        .unwrap();
    assert!(!plan.diagnostics);
    assert!(!plan.extensions.iter().any(|e| e == DEBUG_UTILS_EXTENSION));

    let err = ConnectionBuilder::new("debug")
        .headless(true)
        .diagnostics(Diagnostics::Required)
        .negotiate(&partial)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingCapability);

    let full = loader(ApiVersion::V1_3, &[DEBUG_UTILS_EXTENSION], &[VALIDATION_LAYER]);
    let plan = ConnectionBuilder::new("debug")
        .headless(true)
        .diagnostics(Diagnostics::Required)
        .negotiate(&full)
        .unwrap();
    assert!(plan.diagnostics);
    assert!(plan.layers.iter().any(|l| l == VALIDATION_LAYER));
}

#[test]
fn legacy_loader_gets_properties2_and_portability() {
    let available = loader(
        ApiVersion::V1_0,
        &[PROPERTIES2_EXTENSION, PORTABILITY_ENUMERATION_EXTENSION],
        &[],
    );
    let plan = ConnectionBuilder::new("legacy").headless(true).negotiate(&available).unwrap();
    assert!(plan.properties2);
    assert!(plan.extensions.iter().any(|e| e == PORTABILITY_ENUMERATION_EXTENSION));
    assert!(plan
        .flags
        .contains(ash::vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR));
}
