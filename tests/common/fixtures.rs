//! Test fixtures
//!
//! Helm index documents used by the integration tests.

/// Render a Helm `index.yaml` with the given charts and versions
pub fn index_yaml(charts: &[(&str, &[&str])]) -> String {
    let mut yaml = String::from("apiVersion: v1\nentries:\n");
    for (name, versions) in charts {
        yaml.push_str(&format!("  {}:\n", name));
        for version in versions.iter() {
            yaml.push_str(&format!(
                "    - name: {name}\n      version: {version}\n      description: {name} chart\n      \
                 created: \"2024-03-01T12:00:00Z\"\n      urls:\n        - charts/{name}-{version}.tgz\n",
                name = name,
                version = version
            ));
        }
    }
    yaml.push_str("generated: \"2024-03-01T12:00:00Z\"\n");
    yaml
}

/// An index that lists no charts
pub fn empty_index() -> String {
    "apiVersion: v1\nentries: {}\n".to_string()
}

/// Index A of the prune scenario: `pkg1` and `pkg2`
pub fn index_a() -> String {
    index_yaml(&[("pkg1", &["1.0.0"]), ("pkg2", &["1.0.0"])])
}

/// Index B of the prune scenario: `pkg2` and `pkg3`
pub fn index_b() -> String {
    index_yaml(&[("pkg2", &["1.1.0", "1.0.0"]), ("pkg3", &["0.1.0"])])
}
