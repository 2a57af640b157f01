//! Building stores from TOML configuration.

use lumen_datastore::*;

type SmallRef = EntryRefT<6, 6>;

#[test]
fn config_from_toml_builds_store() {
    let config = ArrayStoreConfig::from_toml_str(
        r#"
        max_small_array_size = 3
        min_clusters = 2
        max_clusters = 1000
        alloc_grow_factor = 0.5
        "#,
    )
    .unwrap();
    // max_clusters is clamped to the 64 offsets of the encoding.
    assert_eq!(config.clamped_clusters::<SmallRef>(), (2, 64));

    let mut store: ArrayStore<i64, SmallRef> = ArrayStore::new(config);
    assert_eq!(store.data_store().num_types(), 4);
    assert_eq!(store.data_store().type_config(2).max_clusters(), 64);
    let entry = store.add(&[-1, -2, -3]);
    assert_eq!(store.get(entry), &[-1, -2, -3]);
    assert_eq!(store.buffer_state(entry).capacity, 2 * 3);
}

#[test]
fn config_empty_toml_is_default() {
    let config = ArrayStoreConfig::from_toml_str("").unwrap();
    assert_eq!(config, ArrayStoreConfig::default());
}

#[test]
fn config_round_trips_through_toml() {
    let config = ArrayStoreConfig::new(5)
        .with_clusters(16, 4096)
        .with_alloc_grow_factor(0.25);
    let text = toml::to_string(&config).unwrap();
    assert_eq!(ArrayStoreConfig::from_toml_str(&text).unwrap(), config);
}

#[test]
fn config_default_round_trips_through_toml() {
    let text = toml::to_string(&ArrayStoreConfig::default()).unwrap();
    let parsed = ArrayStoreConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed, ArrayStoreConfig::default());
    assert_eq!(parsed.max_clusters, None);
}

#[test]
fn config_errors_render_messages() {
    let err = ArrayStoreConfig::from_toml_str("max_clusters = 0").unwrap_err();
    assert_eq!(err.to_string(), "max_clusters must be > 0");

    let err = ArrayStoreConfig::from_toml_str("max_small_array_size = \"four\"").unwrap_err();
    assert!(err.to_string().starts_with("failed to parse array store config"));

    let err = ArrayStoreConfig::new(100)
        .validate_for::<EntryRefT<6, 4>>()
        .unwrap_err();
    assert!(matches!(err, ConfigError::TooManyTypes { types: 101, limit: 16 }));
}

#[test]
#[should_panic(expected = "invalid array store config")]
fn config_invalid_grow_factor_panics_on_build() {
    let config = ArrayStoreConfig::new(2).with_alloc_grow_factor(f64::NAN);
    let _ = ArrayStore::<u32, SmallRef>::new(config);
}
