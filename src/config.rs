use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::default_cache_base;
use crate::error::TaxoError;
use crate::verifier::VerifierOptions;

/// One external taxonomic reference source, identified by the verifier's
/// numeric data-source id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub name: String,
    pub id: u32,
}

/// Default authority precedence: GBIF first, then Open Tree of Life, then
/// Catalogue of Life.
pub fn default_authorities() -> Vec<Authority> {
    vec![
        Authority {
            name: "GBIF".to_string(),
            id: 11,
        },
        Authority {
            name: "OpenTreeOfLife".to_string(),
            id: 172,
        },
        Authority {
            name: "CatalogueOfLife".to_string(),
            id: 1,
        },
    ]
}

/// On-disk config file shape; every field optional so a partial file only
/// overrides what it names.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub authorities: Option<Vec<Authority>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub cache_base_dir: Option<String>,
    #[serde(default)]
    pub cache_max_age_secs: Option<u64>,
    #[serde(default)]
    pub verifier: Option<VerifierOptions>,
}

/// Fully resolved run configuration, threaded explicitly through the
/// grouper, executor, and manager; lifecycle bounded to one invocation.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub authorities: Vec<Authority>,
    pub batch_size: usize,
    pub parallelism: usize,
    pub cache_base_dir: Utf8PathBuf,
    pub cache_max_age_secs: Option<u64>,
    pub verifier: VerifierOptions,
}

impl ResolverConfig {
    pub fn authority_ids(&self) -> Vec<u32> {
        self.authorities.iter().map(|authority| authority.id).collect()
    }

    pub fn primary_authority(&self) -> Option<&Authority> {
        self.authorities.first()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve configuration from an optional JSON file plus defaults. With
    /// no path given, `taxoresolve.json` in the working directory is used
    /// when present; its absence is not an error.
    pub fn resolve(path: Option<&str>) -> Result<ResolverConfig, TaxoError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let default = PathBuf::from("taxoresolve.json");
                default.exists().then_some(default)
            }
        };

        let file = match config_path {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| TaxoError::ConfigRead(config_path.clone()))?;
                serde_json::from_str::<ConfigFile>(&content)
                    .map_err(|err| TaxoError::ConfigParse(err.to_string()))?
            }
            None => ConfigFile::default(),
        };

        Self::resolve_file(file)
    }

    pub fn resolve_file(file: ConfigFile) -> Result<ResolverConfig, TaxoError> {
        let authorities = match file.authorities {
            Some(authorities) if !authorities.is_empty() => authorities,
            Some(_) => return Err(TaxoError::EmptyAuthorityList),
            None => default_authorities(),
        };
        let cache_base_dir = match file.cache_base_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_base()?,
        };

        Ok(ResolverConfig {
            authorities,
            batch_size: file.batch_size.unwrap_or(500),
            parallelism: file.parallelism.unwrap_or(4),
            cache_base_dir,
            cache_max_age_secs: file.cache_max_age_secs,
            verifier: file.verifier.unwrap_or_default(),
        })
    }

    /// Parse a `--sources` style comma-separated override, e.g. "11,172,1".
    pub fn parse_source_override(value: &str) -> Result<Vec<Authority>, TaxoError> {
        let mut authorities = Vec::new();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let id: u32 = part
                .parse()
                .map_err(|_| TaxoError::InvalidAuthority(part.to_string()))?;
            authorities.push(Authority {
                name: format!("source-{id}"),
                id,
            });
        }
        if authorities.is_empty() {
            return Err(TaxoError::EmptyAuthorityList);
        }
        Ok(authorities)
    }
}
