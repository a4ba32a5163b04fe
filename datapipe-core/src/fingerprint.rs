use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::argval::ArgValue;

/// What stands for the app in the digest: the full source blob, or the
/// logical name when the task was declared `named`.
#[derive(Debug, Clone, Copy)]
pub enum AppIdentity<'a> {
    Source(&'a str),
    Name(&'a str),
}

/// Deterministic digest of (code or name) + resolved args + dependency
/// fingerprints; the key into the result cache.
///
/// Every field is fed length-prefixed so adjacent fields cannot run
/// into each other; embedded futures contribute their referent's
/// fingerprint through `ArgValue::fingerprint_form`.
pub fn task_fingerprint(
    identity: AppIdentity<'_>,
    args: &[ArgValue],
    kwargs: &BTreeMap<String, ArgValue>,
    dep_fingerprints: &[String],
) -> String {
    let mut hasher = Sha256::new();

    match identity {
        AppIdentity::Source(source) => feed(&mut hasher, b"code", source.as_bytes()),
        AppIdentity::Name(name) => feed(&mut hasher, b"name", name.as_bytes()),
    }

    let args_form: Vec<ArgValue> = args.iter().map(ArgValue::fingerprint_form).collect();
    let kwargs_form: BTreeMap<&String, ArgValue> = kwargs
        .iter()
        .map(|(key, value)| (key, value.fingerprint_form()))
        .collect();
    let args_json = serde_json::to_vec(&args_form).expect("argument tree serializes");
    let kwargs_json = serde_json::to_vec(&kwargs_form).expect("argument tree serializes");
    feed(&mut hasher, b"args", &args_json);
    feed(&mut hasher, b"kwargs", &kwargs_json);

    for dep in dep_fingerprints {
        feed(&mut hasher, b"dep", dep.as_bytes());
    }

    let digest = hasher.finalize();
    format!("{digest:x}")
}

fn feed(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, ArgValue)]) -> BTreeMap<String, ArgValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn deterministic() {
        let args = vec![ArgValue::Int(3)];
        let kw = kwargs(&[("seed", ArgValue::Int(7))]);
        let a = task_fingerprint(AppIdentity::Source("fn f() {}"), &args, &kw, &[]);
        let b = task_fingerprint(AppIdentity::Source("fn f() {}"), &args, &kw, &[]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn any_source_edit_changes_digest() {
        let kw = BTreeMap::new();
        let a = task_fingerprint(AppIdentity::Source("fn f() { 1 }"), &[], &kw, &[]);
        // a comment-only edit still invalidates
        let b = task_fingerprint(AppIdentity::Source("fn f() { 1 } // v2"), &[], &kw, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn named_identity_ignores_source() {
        let kw = BTreeMap::new();
        let a = task_fingerprint(AppIdentity::Name("fraction"), &[], &kw, &[]);
        let b = task_fingerprint(AppIdentity::Name("fraction"), &[], &kw, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn arguments_and_deps_participate() {
        let kw = BTreeMap::new();
        let base = task_fingerprint(AppIdentity::Name("f"), &[ArgValue::Int(1)], &kw, &[]);
        let other_arg = task_fingerprint(AppIdentity::Name("f"), &[ArgValue::Int(2)], &kw, &[]);
        let with_dep = task_fingerprint(
            AppIdentity::Name("f"),
            &[ArgValue::Int(1)],
            &kw,
            &["abc".to_string()],
        );
        assert_ne!(base, other_arg);
        assert_ne!(base, with_dep);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let kw = BTreeMap::new();
        // "ab" + "c" must not collide with "a" + "bc" across dep entries
        let a = task_fingerprint(
            AppIdentity::Name("f"),
            &[],
            &kw,
            &["ab".to_string(), "c".to_string()],
        );
        let b = task_fingerprint(
            AppIdentity::Name("f"),
            &[],
            &kw,
            &["a".to_string(), "bc".to_string()],
        );
        assert_ne!(a, b);
    }
}
