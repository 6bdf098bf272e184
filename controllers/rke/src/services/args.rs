//! Command-line assembly

use std::collections::BTreeMap;

/// Merge flag layers into sorted `--key=value` arguments
///
/// `computed` overrides `defaults`, `extra` overrides both; an `extra` value
/// of `""` drops the key entirely.
#[must_use]
pub fn merge_args(
    defaults: BTreeMap<String, String>,
    computed: BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut merged = defaults;
    merged.extend(computed);
    for (key, value) in extra {
        if value.is_empty() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.into_iter().map(|(k, v)| format!("--{k}={v}")).collect()
}

/// Build a flag map from string pairs
pub(crate) fn flag_map<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> BTreeMap<String, String> {
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Value of `--key=` in an argument list
#[must_use]
pub fn flag_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("--{key}=");
    args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_and_deletion() {
        let defaults = flag_map([("v", "2"), ("profiling", "false"), ("anonymous-auth", "false")]);
        let computed = flag_map([("v", "4"), ("bind-address", "0.0.0.0")]);
        let extra = flag_map([("profiling", ""), ("audit-log-path", "-")]);
        assert_eq!(
            merge_args(defaults, computed, &extra),
            vec!["--anonymous-auth=false", "--audit-log-path=-", "--bind-address=0.0.0.0", "--v=4"]
        );
    }

    #[test]
    fn test_flag_value() {
        let args = vec!["--name=etcd-a".to_string(), "--initial-cluster-state=new".to_string()];
        assert_eq!(flag_value(&args, "initial-cluster-state"), Some("new"));
        assert_eq!(flag_value(&args, "initial-cluster"), None);
    }
}
