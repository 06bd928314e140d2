/// Maps a Zendure product id to the prefix its hub advertises over BLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductProfile {
    pub product_id: &'static str,
    pub name_prefix: &'static str,
}

pub const DEFAULT_PRODUCT_ID: &str = "ja72U0ha";

/// Prefix used when the product id is not in [`PROFILES`].
pub const GENERIC_PREFIX: &str = "zen";

pub const PROFILES: [ProductProfile; 5] = [
    // Hub1200
    ProductProfile { product_id: "73bkTV", name_prefix: "zenp" },
    // Hub2000
    ProductProfile { product_id: "A8yh63", name_prefix: "zenh" },
    // AIO2400
    ProductProfile { product_id: "yWF7hV", name_prefix: "zenr" },
    // Hyper2000
    ProductProfile { product_id: "ja72U0ha", name_prefix: "zene" },
    ProductProfile { product_id: "8bM93H", name_prefix: "zenf" },
];

/// Resolve the advertised name prefix for `product_id`. Never fails.
pub fn resolve_profile(product_id: &str) -> &'static str {
    PROFILES
        .iter()
        .find(|profile| profile.product_id == product_id)
        .map(|profile| profile.name_prefix)
        .unwrap_or(GENERIC_PREFIX)
}

/// Case-insensitive prefix match against an advertised name.
pub fn matches_prefix(name: Option<&str>, prefix: &str) -> bool {
    match name {
        Some(name) => name.to_lowercase().starts_with(&prefix.to_lowercase()),
        None => false,
    }
}

#[test]
fn test_resolve_known_products() {
    for profile in PROFILES {
        assert_eq!(resolve_profile(profile.product_id), profile.name_prefix);
    }
    assert_eq!(resolve_profile(DEFAULT_PRODUCT_ID), "zene");
}

#[test]
fn test_resolve_unknown_product_falls_back() {
    assert_eq!(resolve_profile("nope"), GENERIC_PREFIX);
    assert_eq!(resolve_profile(""), GENERIC_PREFIX);
    // product ids are case sensitive
    assert_eq!(resolve_profile("JA72U0HA"), GENERIC_PREFIX);
}

#[test]
fn test_matches_prefix() {
    assert!(matches_prefix(Some("ZenE-1234"), "zene"));
    assert!(matches_prefix(Some("zenp_abc"), "ZENP"));
    assert!(!matches_prefix(Some("Phone"), "zen"));
    assert!(!matches_prefix(Some("ze"), "zen"));
    assert!(!matches_prefix(None, "zen"));
}
