//! Bundles of knowledge bases sharing one storage root.

use knowledge_store::{
    BigMap, BigMapField, KnowledgeBase, MapBinder, MapKind, ModelParameters, Result,
    StorageConfiguration, StorageEngine, StorageHint, Trainable, TrainableBundle,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectorParameters {
    selected: Vec<String>,
    #[serde(skip)]
    scores: BigMap<String, f64>,
}

impl ModelParameters for SelectorParameters {
    fn big_map_fields() -> Vec<BigMapField> {
        vec![BigMapField::new::<String, f64>(
            "scores",
            MapKind::TreeMap,
            StorageHint::InDisk,
            false,
        )]
    }

    fn bind_big_maps(&mut self, binder: &mut MapBinder<'_>) -> Result<()> {
        binder.bind("scores", &mut self.scores)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExtractorParameters {
    ngrams: usize,
}

impl ModelParameters for ExtractorParameters {}

type Selector = KnowledgeBase<SelectorParameters, u32>;
type Extractor = KnowledgeBase<ExtractorParameters, ()>;

const TAGS: [&str; 3] = ["ce", "fs0", "fs1"];

fn backends(root: &TempDir) -> Vec<StorageConfiguration> {
    vec![
        StorageConfiguration::in_memory(root.path().join("mem")),
        StorageConfiguration::disk(root.path().join("disk")),
    ]
}

fn populate(bundle: &mut TrainableBundle) -> Result<()> {
    let ce = bundle.get_or_load("ce", |name, config| Extractor::open(name, config))?;
    ce.model_parameters_mut().ngrams = 2;
    for tag in ["fs0", "fs1"] {
        let fs = bundle.get_or_load(tag, |name, config| Selector::open(name, config))?;
        fs.model_parameters_mut().selected = vec![format!("{tag}-feature")];
        fs.model_parameters().scores.insert(format!("{tag}-feature"), 0.75)?;
    }
    Ok(())
}

#[test]
fn members_are_namespaced_under_the_base() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let config = StorageConfiguration::disk(root.path());
    let mut bundle = TrainableBundle::new("pipeline", &config)?;
    populate(&mut bundle)?;

    assert_eq!(bundle.tags(), vec!["ce", "fs0", "fs1"]);
    for tag in TAGS {
        let member = bundle.get(tag).expect("member cached");
        assert_eq!(member.storage_name(), format!("pipeline/{tag}"));
    }
    bundle.save()?;
    assert!(root.path().join("pipeline").join("fs0").join("PRIMARY_STORAGE").exists());
    Ok(())
}

#[test]
fn save_and_reload_members() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    for config in backends(&root) {
        {
            let mut bundle = TrainableBundle::new("pipeline", &config)?;
            populate(&mut bundle)?;
            bundle.save()?;
            bundle.close()?;
        }

        let mut bundle = TrainableBundle::new("pipeline", &config)?;
        assert_eq!(bundle.stored_tags()?, vec!["ce", "fs0", "fs1"]);
        assert!(bundle.is_empty());

        let fs1 = bundle.get_or_load("fs1", |name, config| Selector::load(name, config))?;
        assert_eq!(fs1.model_parameters().selected, vec!["fs1-feature"]);
        let ce: &mut Extractor = bundle.get_or_load("ce", |name, config| Extractor::load(name, config))?;
        assert_eq!(ce.model_parameters().ngrams, 2);
        assert!(bundle.get_as::<Selector>("fs1").is_some());
        assert!(!bundle.contains_key("fs0"));
    }
    Ok(())
}

#[test]
fn delete_cascades_to_every_member() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    for config in backends(&root) {
        let mut bundle = TrainableBundle::new("pipeline", &config)?;
        populate(&mut bundle)?;
        bundle.save()?;
        let names: Vec<String> = TAGS
            .iter()
            .map(|tag| bundle.sub_storage_name(tag))
            .collect::<Result<_>>()?;

        bundle.delete()?;
        assert!(bundle.is_empty());
        assert!(!config.root_directory.join("pipeline").exists());

        for name in names.iter().map(String::as_str).chain(["pipeline"]) {
            let engine = config.open(name)?;
            assert!(
                !engine.exists_object("modelParameters")?,
                "{name} still has model parameters"
            );
            assert!(!engine.exists_object("trainingParameters")?);
            assert!(!engine.exists_object("bundleTags")?);
        }
    }
    Ok(())
}

#[test]
fn close_cascades_to_every_member() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let config = StorageConfiguration::in_memory(root.path());
    let mut bundle = TrainableBundle::new("pipeline", &config)?;
    populate(&mut bundle)?;
    let scores = bundle
        .get_as::<Selector>("fs0")
        .expect("selector cached")
        .model_parameters()
        .scores
        .clone();

    bundle.close()?;
    assert!(bundle.engine().is_closed());
    assert!(bundle.get_as::<Selector>("fs0").expect("still cached").is_closed());
    assert!(scores.len().is_err());
    Ok(())
}

#[test]
fn put_replaces_members() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let config = StorageConfiguration::in_memory(root.path());
    let mut bundle = TrainableBundle::new("pipeline", &config)?;
    let name = bundle.sub_storage_name("ml")?;

    assert!(bundle.put("ml", Extractor::open(&name, &config)?)?.is_none());
    let previous = bundle.put("ml", Extractor::open(&name, &config)?)?;
    assert!(previous.is_some());
    assert!(bundle.put("Bad Tag", Extractor::open(&name, &config)?).is_err());
    Ok(())
}
