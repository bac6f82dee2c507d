use std::collections::BTreeMap;

use tracing::debug;

use crate::domain::{sha256_hex, EntryGroupRef, Rank, TaxonomicEntry, Taxonomy};

/// Canonicalization version folded into every fingerprint. Any change to the
/// normalization below is a breaking cache-format change and must bump this.
const FINGERPRINT_VERSION: &str = "v1";

fn normalize(value: Option<&str>) -> String {
    value.map(|v| v.trim().to_lowercase()).unwrap_or_default()
}

/// Deterministic fingerprint over the ordered rank tuple plus the scientific
/// name. Identical normalized input data always yields the same key, within a
/// run and across runs.
pub fn group_key(taxonomy: &Taxonomy, scientific_name: Option<&str>) -> String {
    let fields = [
        normalize(taxonomy.rank(Rank::Kingdom)),
        normalize(taxonomy.rank(Rank::Phylum)),
        normalize(taxonomy.rank(Rank::Class)),
        normalize(taxonomy.rank(Rank::Order)),
        normalize(taxonomy.rank(Rank::Family)),
        normalize(taxonomy.rank(Rank::Genus)),
        normalize(taxonomy.rank(Rank::Species)),
        normalize(scientific_name),
    ];
    let canonical = format!("{FINGERPRINT_VERSION}|{}", fields.join("|"));
    sha256_hex(canonical.as_bytes())
}

/// Collapse entries with identical taxonomic fingerprints into groups. The
/// returned map is ordered by key and member uuid lists are sorted, so the
/// result is byte-identical across runs on unchanged input.
pub fn group_entries(entries: &[TaxonomicEntry]) -> BTreeMap<String, EntryGroupRef> {
    let mut groups: BTreeMap<String, EntryGroupRef> = BTreeMap::new();

    for entry in entries {
        let key = group_key(&entry.taxonomy, entry.scientific_name.as_deref());
        groups
            .entry(key.clone())
            .or_insert_with(|| EntryGroupRef {
                key,
                entry_uuids: Vec::new(),
                taxonomy: entry.taxonomy.clone(),
                scientific_name: entry.scientific_name.clone(),
            })
            .entry_uuids
            .push(entry.uuid.clone());
    }

    for group in groups.values_mut() {
        group.entry_uuids.sort();
        group.entry_uuids.dedup();
    }

    debug!(
        groups = groups.len(),
        entries = entries.len(),
        "grouped entries by taxonomic fingerprint"
    );
    groups
}
