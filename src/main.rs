use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use whalegraph::{
    enqueue_all_layers, label_cluster_members, ChainDataSource, ClusterDetector, DetectorConfig,
    EntityPatch, GraphStore, LabelPropagator, Layer, MergeConfig, MergeEngine, NewEvidence,
    PatternMatcher, Pipeline, PipelineConfig, PropagationConfig, StaticDataSource, TypeSource,
    WriteSource,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "init" => cmd_init(&args),
        "stats" => cmd_stats(&args),
        "run" => cmd_run(&args),
        "query" => cmd_query(&args),
        "export" => cmd_export(&args),
        "identify" => cmd_identify(&args),
        "propagate" => cmd_propagate(&args),
        "suggest-type" => cmd_suggest_type(&args),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command: {}", other)
        }
    }
}

fn print_usage() {
    println!("🕸️  whalegraph - knowledge graph for whale deanonymization");
    println!();
    println!("Usage:");
    println!("  whalegraph init [--db PATH]");
    println!("  whalegraph run [--db PATH] [--data DIR] [--layer NAME]");
    println!("  whalegraph stats [--db PATH]");
    println!("  whalegraph query (--address ADDR | --entity NAME) [--db PATH]");
    println!("  whalegraph export -o FILE [--db PATH]");
    println!("  whalegraph identify ADDR NAME [--confidence C] [--db PATH]");
    println!("  whalegraph propagate ADDR [--confidence C] [--db PATH]");
    println!("  whalegraph suggest-type ADDR [--db PATH]");
    println!();
    println!("Layers: expansion, behavioral, osint");
    println!("Data dir files: transfers.csv, contracts.csv, ens.csv, votes.csv, identities.csv");
}

// ============================================================================
// FLAG HELPERS
// ============================================================================

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn db_path(args: &[String]) -> PathBuf {
    flag_value(args, "--db")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("whalegraph.db"))
}

fn open_store(args: &[String]) -> Result<GraphStore> {
    let path = db_path(args);
    if !path.exists() {
        bail!("database {:?} not found - run `whalegraph init` first", path);
    }
    GraphStore::open(&path)
}

/// Positional arguments after the command, skipping flag/value pairs.
fn positional<'a>(args: &'a [String], index: usize) -> Option<&'a String> {
    let mut seen = 0usize;
    let mut i = 2;
    while i < args.len() {
        if args[i].starts_with("--") || args[i] == "-o" {
            i += 2;
            continue;
        }
        if seen == index {
            return Some(&args[i]);
        }
        seen += 1;
        i += 1;
    }
    None
}

// ============================================================================
// COMMANDS
// ============================================================================

fn cmd_init(args: &[String]) -> Result<()> {
    let path = db_path(args);
    GraphStore::open(&path)?;
    println!("✓ Graph database initialized at {:?}", path);
    Ok(())
}

fn cmd_stats(args: &[String]) -> Result<()> {
    let store = open_store(args)?;
    let stats = store.stats()?;

    println!("📊 Knowledge graph");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Entities:       {} ({} identified)",
        stats.entities, stats.identified_entities
    );
    println!(
        "Clusters:       {} (largest {})",
        stats.clusters, stats.largest_cluster
    );
    println!("Relationships:  {}", stats.relationships);
    println!("Evidence:       {}", stats.evidence);
    let mut statuses: Vec<(&String, &i64)> = stats.queue_by_status.iter().collect();
    statuses.sort();
    for (status, count) in statuses {
        println!("Queue {:11} {}", format!("{}:", status), count);
    }
    Ok(())
}

fn cmd_run(args: &[String]) -> Result<()> {
    let mut store = open_store(args)?;
    let data_dir = flag_value(args, "--data").unwrap_or_else(|| "data".to_string());
    let layer = match flag_value(args, "--layer") {
        Some(name) => {
            Some(Layer::parse(&name).with_context(|| format!("unknown layer: {}", name))?)
        }
        None => None,
    };

    if !Path::new(&data_dir).is_dir() {
        bail!("data directory {:?} not found", data_dir);
    }
    println!("📂 Loading warehouse exports from {:?}...", data_dir);
    let source = StaticDataSource::load_dir(&data_dir)?;

    let seeds = source.seed_addresses();
    let mut queued = 0;
    for address in &seeds {
        queued += enqueue_all_layers(&mut store, address)?;
    }
    println!(
        "✓ {} addresses known, {} queue items added",
        seeds.len(),
        queued
    );

    println!("\n⚙️  Running enrichment pipeline...");
    let pipeline = Pipeline::new(&source, &source, PipelineConfig::default());
    let report = pipeline.run(&mut store, layer)?;
    println!(
        "✓ {} layer tasks completed, {} failed",
        report.completed(),
        report.failed()
    );
    for item in &report.permanently_failed {
        println!(
            "  ⚠ permanently failed: {} [{}] after {} attempts ({})",
            item.address,
            item.layer.as_str(),
            item.attempts,
            item.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    if layer.is_none() {
        println!("\n🔍 Running cluster detection...");
        let transfers = source.all_transfers()?;
        let detector = ClusterDetector::new(DetectorConfig::default());
        let detection = detector.run(&mut store, &transfers, &source.contract_addresses())?;
        println!(
            "✓ {} candidates, {} relationships, {} clusters created, {} reinforced",
            detection.candidates,
            detection.relationships_written,
            detection.clusters_created,
            detection.clusters_reinforced
        );

        println!("\n🔗 Reconciling overlapping clusters...");
        let merges = MergeEngine::new(MergeConfig::default()).reconcile(&mut store)?;
        println!("✓ {} merges", merges.merged());
    }

    let stats = store.stats()?;
    println!(
        "\n✓ Graph now holds {} entities, {} clusters, {} relationships",
        stats.entities, stats.clusters, stats.relationships
    );
    Ok(())
}

fn cmd_query(args: &[String]) -> Result<()> {
    let store = open_store(args)?;

    if let Some(address) = flag_value(args, "--address") {
        let Some(entity) = store.get_entity(&address)? else {
            println!("No entity for {}", address);
            return Ok(());
        };
        println!("🔎 {}", entity.address);
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Identity:    {}", entity.identity.as_deref().unwrap_or("-"));
        println!(
            "Type:        {} (set by {})",
            entity.entity_type.as_str(),
            entity.type_source.as_str()
        );
        println!("Confidence:  {:.2}", entity.confidence);
        println!("ENS:         {}", entity.ens_name.as_deref().unwrap_or("-"));
        if let Some(cluster_id) = &entity.cluster_id {
            let members = store.cluster_member_count(cluster_id)?;
            println!("Cluster:     {} ({} members)", cluster_id, members);
        }
        println!("\nRelationships:");
        for rel in store.relationships_for(&entity.address)? {
            println!(
                "  {} -[{} {:.2}]-> {}  ({})",
                rel.source,
                rel.relationship_type.as_str(),
                rel.confidence,
                rel.target,
                rel.evidence_ref
            );
        }
        println!("\nEvidence:");
        for ev in store.evidence_for(&entity.address)? {
            println!("  [{}] {:.2} {}", ev.source, ev.confidence, ev.claim);
        }
        return Ok(());
    }

    if let Some(name) = flag_value(args, "--entity") {
        let matches = store.find_by_identity(&name)?;
        if matches.is_empty() {
            println!("No entities matching \"{}\"", name);
            return Ok(());
        }
        println!("🔎 {} entities matching \"{}\"", matches.len(), name);
        for e in matches {
            println!(
                "  {}  {:.2}  {}  {}",
                e.address,
                e.confidence,
                e.entity_type.as_str(),
                e.identity.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }

    bail!("query needs --address or --entity");
}

fn cmd_export(args: &[String]) -> Result<()> {
    let store = open_store(args)?;
    let Some(out) = flag_value(args, "-o").or_else(|| flag_value(args, "--output")) else {
        bail!("export needs -o FILE");
    };

    let entities = store.all_entities()?;
    let addresses: Vec<String> = entities.iter().map(|e| e.address.clone()).collect();
    // One batched fetch for the whole export, not a query per entity.
    let mut evidence = store.get_evidence_for(&addresses)?;

    let rows: Vec<serde_json::Value> = entities
        .into_iter()
        .map(|e| {
            let evidence = evidence.remove(&e.address).unwrap_or_default();
            serde_json::json!({
                "address": e.address,
                "identity": e.identity,
                "entity_type": e.entity_type.as_str(),
                "confidence": e.confidence,
                "cluster_id": e.cluster_id,
                "ens_name": e.ens_name,
                "evidence": evidence,
            })
        })
        .collect();

    std::fs::write(&out, serde_json::to_string_pretty(&rows)?)
        .with_context(|| format!("failed to write export to {:?}", out))?;
    println!("✓ Exported {} entities to {}", rows.len(), out);
    Ok(())
}

fn cmd_identify(args: &[String]) -> Result<()> {
    let mut store = open_store(args)?;
    let (Some(address), Some(name)) = (positional(args, 0), positional(args, 1)) else {
        bail!("identify needs ADDR NAME");
    };
    let name = name.clone();
    let confidence = match flag_value(args, "--confidence") {
        Some(c) => c.parse::<f64>().context("--confidence must be a number")?,
        None => 0.95,
    };

    let mut patch = EntityPatch::new(address);
    patch.identity = Some(name.clone());
    patch.confidence = Some(confidence);
    let entity = store.upsert_entity(&patch, WriteSource::Manual)?;
    store.add_evidence(&NewEvidence::new(
        &entity.address,
        "manual",
        &format!("operator identification: {}", name),
        confidence,
    ))?;
    println!(
        "✓ {} identified as \"{}\" ({:.2})",
        entity.address, name, confidence
    );

    if let Some(cluster_id) = &entity.cluster_id {
        let labeled =
            label_cluster_members(&mut store, cluster_id, &name, confidence, &entity.address)?;
        println!(
            "✓ {} cluster members labeled \"{} (cluster member)\"",
            labeled, name
        );
    }
    Ok(())
}

fn cmd_propagate(args: &[String]) -> Result<()> {
    let mut store = open_store(args)?;
    let Some(address) = positional(args, 0) else {
        bail!("propagate needs ADDR");
    };
    let Some(entity) = store.get_entity(address)? else {
        bail!("no entity for {}", address);
    };
    let Some(identity) = entity.identity.clone() else {
        bail!(
            "{} has no identity to propagate - run identify first",
            entity.address
        );
    };
    let confidence = match flag_value(args, "--confidence") {
        Some(c) => c.parse::<f64>().context("--confidence must be a number")?,
        None => entity.confidence,
    };

    println!(
        "🏷️  Propagating \"{}\" from {} at {:.2}...",
        identity, entity.address, confidence
    );
    let propagator = LabelPropagator::new(PropagationConfig::default());
    let report = propagator.propagate(&mut store, &entity.address, &identity, confidence)?;

    for label in &report.labeled {
        println!(
            "  {}  {:.2}  via {} ({} hops)  {}",
            label.address,
            label.confidence,
            label.via.as_str(),
            label.hops,
            label.identity
        );
    }
    println!(
        "✓ {} addresses labeled, {} conflicts kept their identity",
        report.labeled.len(),
        report.conflicts_kept_existing
    );
    Ok(())
}

fn cmd_suggest_type(args: &[String]) -> Result<()> {
    let mut store = open_store(args)?;
    let Some(address) = positional(args, 0) else {
        bail!("suggest-type needs ADDR");
    };
    let address = address.clone();

    let matcher = PatternMatcher::new();
    let suggestions = matcher.score_all(&store, &address)?;
    println!("🧩 Template scores for {}", address);
    for s in &suggestions {
        println!(
            "  {:20} {:.2} (confidence {:.2})  [{}]",
            s.template,
            s.score,
            s.confidence,
            s.matched.join(", ")
        );
    }

    let Some(best) = suggestions
        .into_iter()
        .find(|s| s.score >= matcher.min_score)
    else {
        println!("No template clears the {:.2} floor", matcher.min_score);
        return Ok(());
    };
    store.add_evidence(&NewEvidence::new(
        &address,
        "pattern_matcher",
        &format!(
            "matches template {} ({})",
            best.template,
            best.matched.join(", ")
        ),
        best.confidence,
    ))?;
    let mut patch = EntityPatch::new(&address);
    patch.entity_type = Some(best.entity_type);
    patch.type_source = TypeSource::Behavioral;
    store.upsert_entity(&patch, WriteSource::Automated)?;
    println!(
        "✓ Suggested type {} from template {}",
        best.entity_type.as_str(),
        best.template
    );
    Ok(())
}
