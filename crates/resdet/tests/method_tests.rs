//! Method registry tests

use resdet::{ParameterOverrides, Resdet};

#[test]
fn test_methods_in_engine_order() {
    let resdet = Resdet::in_memory();
    let methods = resdet.methods().unwrap();
    let names: Vec<&str> = methods.iter().map(|m| m.name()).collect();
    assert_eq!(names, vec!["sign", "mag", "orig", "zerox"]);
}

#[test]
fn test_get_method_by_name() {
    let resdet = Resdet::in_memory();
    let zerox = resdet.get_method("zerox").unwrap();
    assert!(zerox.is_some());
    assert_eq!(zerox.unwrap().name(), "zerox");
}

#[test]
fn test_get_missing_method() {
    let resdet = Resdet::in_memory();
    assert!(resdet.get_method("fourier").unwrap().is_none());
    assert!(resdet.get_method("ZEROX").unwrap().is_none());
}

#[test]
fn test_thresholds_are_engine_defaults() {
    let resdet = Resdet::in_memory();
    let mag = resdet.get_method("mag").unwrap().unwrap();
    assert_eq!(mag.threshold(), 0.40);
}

#[test]
fn test_zero_crossing_method_searches_full_range() {
    let resdet = Resdet::in_memory();
    let zerox = resdet.get_method("zerox").unwrap();
    let stripes = [0.0, 1.0, 0.0, 1.0];

    let result = resdet
        .detect(&stripes, 1, 4, 1, zerox.as_ref(), &ParameterOverrides::new())
        .unwrap();
    assert_eq!(result.widths.len(), 3);

    let result = resdet
        .detect(&stripes, 1, 4, 1, None, &ParameterOverrides::new())
        .unwrap();
    assert_eq!(result.widths.len(), 1);
}

#[test]
fn test_methods_serialize_without_handle() {
    let resdet = Resdet::in_memory();
    let sign = resdet.get_method("sign").unwrap().unwrap();
    let json = serde_json::to_value(&sign).unwrap();
    assert_eq!(json["name"], "sign");
    assert!(json.get("handle").is_none());
}
