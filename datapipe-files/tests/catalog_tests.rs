use std::collections::BTreeMap;

use datapipe_core::{ArgValue, Environment};
use datapipe_files::{FileCatalog, FileEntry};

const SAMPLE: &str = r#"---
description: galaxy catalogs split by tracer and region
id: catalog
filetype: catalog
path: ${DATA_ROOT}/catalogs/data_{tracer}_{region}.fits
author: survey-ops
options:
  tracer: [LRG, ELG]
  region: [NGC, SGC]
---
description: power spectrum measurements per realization
id: power
filetype: power
path: power/pk_{tracer}_{i:03d}.npy
options:
  tracer: [LRG]
  i: range(0, 4)
"#;

fn filters(pairs: &[(&str, Vec<ArgValue>)]) -> BTreeMap<String, Vec<ArgValue>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn parses_a_multi_document_stream() {
    let catalog = FileCatalog::parse(SAMPLE).unwrap();
    assert_eq!(catalog.len(), 2);

    let entry = catalog.get("catalog").unwrap();
    assert_eq!(entry.filetype, "catalog");
    assert_eq!(entry.author.as_deref(), Some("survey-ops"));
    assert_eq!(entry.len(), 4); // 2 tracers x 2 regions

    let power = catalog.get("power").unwrap();
    assert_eq!(
        power.options["i"],
        vec![
            ArgValue::Int(0),
            ArgValue::Int(1),
            ArgValue::Int(2),
            ArgValue::Int(3)
        ]
    );
    assert_eq!(power.len(), 4);
}

#[test]
fn iteration_covers_the_option_product() {
    let catalog = FileCatalog::parse(SAMPLE).unwrap();
    let entry = catalog.get("catalog").unwrap();

    let files: Vec<_> = entry.iter().collect();
    assert_eq!(files.len(), 4);

    let mut combos: Vec<(String, String)> = files
        .iter()
        .map(|f| {
            (
                f.options["tracer"].as_str().unwrap().to_string(),
                f.options["region"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    combos.sort();
    combos.dedup();
    assert_eq!(combos.len(), 4);
}

#[test]
fn rpath_formats_options_and_environment() {
    let catalog = FileCatalog::parse(SAMPLE).unwrap();
    let env = Environment::new().with("DATA_ROOT", "/scratch/survey");

    let file = catalog.get("catalog").unwrap().iter().next().unwrap();
    let rpath = file.rpath(&env).unwrap();
    assert!(rpath.starts_with("/scratch/survey/catalogs/data_"));
    assert!(rpath.ends_with(".fits"));

    // zero-padded formatting from the template spec
    let power = catalog.get("power").unwrap();
    let first = power.iter().next().unwrap();
    assert_eq!(first.rpath(&env).unwrap(), "power/pk_LRG_000.npy");

    // unknown environment names stay in place
    let bare = file.rpath(&Environment::new()).unwrap();
    assert!(bare.starts_with("${DATA_ROOT}/catalogs/"));
}

#[test]
fn select_narrows_options() {
    let catalog = FileCatalog::parse(SAMPLE).unwrap();
    let entry = catalog.get("catalog").unwrap();

    let narrowed = entry
        .select(&filters(&[("region", vec![ArgValue::Str("NGC".into())])]))
        .unwrap();
    assert_eq!(narrowed.len(), 2);
    for file in narrowed.iter() {
        assert_eq!(file.options["region"], ArgValue::Str("NGC".into()));
    }

    // unknown option and out-of-set values are refused
    assert!(entry
        .select(&filters(&[("nope", vec![ArgValue::Int(1)])]))
        .is_err());
    assert!(entry
        .select(&filters(&[("region", vec![ArgValue::Str("MOON".into())])]))
        .is_err());
}

#[test]
fn catalog_select_by_keyword_and_filter() {
    let catalog = FileCatalog::parse(SAMPLE).unwrap();

    let found = catalog.select(&["power", "realization"], &BTreeMap::new()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.entries()[0].id, "power");

    // the option filter drops entries that lack the option
    let tracer_lrg = catalog
        .select(&[], &filters(&[("i", vec![ArgValue::Int(2)])]))
        .unwrap();
    assert_eq!(tracer_lrg.len(), 1);
    assert_eq!(tracer_lrg.entries()[0].options["i"], vec![ArgValue::Int(2)]);

    assert!(catalog.select(&["no such thing"], &BTreeMap::new()).unwrap().is_empty());
}

#[test]
fn save_and_reload_roundtrip() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("files.yaml");

    let mut catalog = FileCatalog::parse(SAMPLE).unwrap();
    let extra = FileEntry {
        description: "hand-built entry".to_string(),
        id: "extra".to_string(),
        filetype: "text".to_string(),
        path: "notes_{i:d}.txt".to_string(),
        author: None,
        options: filters(&[("i", vec![ArgValue::Int(1), ArgValue::Int(2)])]),
    };
    catalog.append(extra);
    catalog.save(&path).unwrap();

    let reloaded = FileCatalog::load(&path).unwrap();
    assert_eq!(reloaded.len(), 3);
    assert_eq!(reloaded.get("extra").unwrap().len(), 2);
    assert_eq!(
        reloaded.get("power").unwrap().options["i"].len(),
        4,
        "range options reload as explicit lists"
    );
}

#[test]
fn files_iterates_all_entries() {
    let catalog = FileCatalog::parse(SAMPLE).unwrap();
    assert_eq!(catalog.files().count(), 8);
}
