use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing;

use keeper_core::config::CollectorConfig;

/// Built-in fallback tier of the seed resolution order.
pub const DEFAULT_SEED_ASINS: [&str; 10] = [
    "B005EOWBHC", // Logitech K120 QWERTZ
    "B00F34GN18", // Cherry Stream
    "B0058UR5GS", // Cherry KC 1000
    "B07W6JN8V8", // Logitech K380
    "B07VBFK1C4", // Logitech MX Keys
    "B09DFY1LKY", // Logitech MX Mechanical
    "B09FXYV8P9", // Corsair K70 RGB
    "B0B6BCXRDS", // Razer BlackWidow V4
    "B09V3KXJPB", // Logitech MX Keys Mini
    "B07W7Q58J7", // Logitech K270
];

#[derive(Debug, Clone, PartialEq)]
pub struct SeedTarget {
    pub asin: String,
    pub domain_id: u32,
    pub market: String,
}

impl SeedTarget {
    fn new(asin: &str, domain_id: u32) -> Option<Self> {
        let asin = asin.trim().to_ascii_uppercase();
        if asin.len() != 10 || !asin.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let domain_id = if keeper_keepa::domain_code(domain_id).is_some() {
            domain_id
        } else {
            3
        };
        let market = keeper_keepa::domain_code(domain_id)
            .unwrap_or("de")
            .to_ascii_uppercase();
        Some(SeedTarget { asin, domain_id, market })
    }
}

/// Seed resolution with a hot-reloaded seed file: the file's mtime is
/// checked once per iteration and the cached parse is reused when it has
/// not advanced.
pub struct SeedSource {
    targets_file: PathBuf,
    seed_file: PathBuf,
    env_asins: String,
    seed_cache: Option<(SystemTime, Vec<SeedTarget>)>,
}

impl SeedSource {
    pub fn new(config: &CollectorConfig) -> Self {
        SeedSource {
            targets_file: PathBuf::from(&config.targets_file),
            seed_file: PathBuf::from(&config.seed_file),
            env_asins: config.seed_asins.clone(),
            seed_cache: None,
        }
    }

    /// Resolution order: targets file, seed file, environment override,
    /// built-in defaults.
    pub fn resolve(&mut self) -> Vec<SeedTarget> {
        let targets = load_targets_file(&self.targets_file);
        if !targets.is_empty() {
            return dedupe(targets);
        }

        let from_file = self.load_seed_file();
        if !from_file.is_empty() {
            return dedupe(from_file);
        }

        let from_env = parse_inline_asins(&self.env_asins);
        if !from_env.is_empty() {
            return dedupe(from_env);
        }

        dedupe(
            DEFAULT_SEED_ASINS
                .iter()
                .filter_map(|asin| SeedTarget::new(asin, 3))
                .collect(),
        )
    }

    fn load_seed_file(&mut self) -> Vec<SeedTarget> {
        let Ok(metadata) = std::fs::metadata(&self.seed_file) else {
            return Vec::new();
        };
        let Ok(modified) = metadata.modified() else {
            return Vec::new();
        };

        if let Some((cached_mtime, cached)) = &self.seed_cache {
            if *cached_mtime == modified {
                return cached.clone();
            }
        }

        let targets = match std::fs::read_to_string(&self.seed_file) {
            Ok(content) => parse_seed_lines(&content),
            Err(e) => {
                tracing::warn!("Could not read seed file {:?}: {}", self.seed_file, e);
                return Vec::new();
            }
        };

        tracing::info!(
            "Loaded {} seed codes from {:?}",
            targets.len(),
            self.seed_file
        );
        self.seed_cache = Some((modified, targets.clone()));
        targets
    }
}

/// One code per line; `#` starts a comment, trailing tokens are ignored.
fn parse_seed_lines(content: &str) -> Vec<SeedTarget> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let token = line.split_whitespace().next()?;
            SeedTarget::new(token, 3)
        })
        .collect()
}

/// Comma-separated inline override, optionally `CODE:domain_id`.
fn parse_inline_asins(raw: &str) -> Vec<SeedTarget> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            match entry.split_once(':') {
                Some((asin, domain)) => {
                    SeedTarget::new(asin, domain.trim().parse().unwrap_or(3))
                }
                None => SeedTarget::new(entry, 3),
            }
        })
        .collect()
}

/// Header-led CSV with asin and domain_id columns.
fn load_targets_file(path: &Path) -> Vec<SeedTarget> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut lines = content.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    let asin_col = columns.iter().position(|c| *c == "asin");
    let domain_col = columns.iter().position(|c| *c == "domain_id");
    let Some(asin_col) = asin_col else {
        return Vec::new();
    };

    let targets: Vec<SeedTarget> = lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
            let asin = fields.get(asin_col)?;
            let domain_id = domain_col
                .and_then(|i| fields.get(i))
                .and_then(|v| v.parse().ok())
                .unwrap_or(3);
            SeedTarget::new(asin, domain_id)
        })
        .collect();

    if !targets.is_empty() {
        tracing::info!("Loaded {} seed targets from {:?}", targets.len(), path);
    }
    targets
}

fn dedupe(targets: Vec<SeedTarget>) -> Vec<SeedTarget> {
    let mut seen = std::collections::HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert((t.asin.clone(), t.domain_id)))
        .collect()
}

/// Rotating batch selection so every seed is visited across iterations.
pub fn select_batch(targets: &[SeedTarget], batch_size: usize, cursor: usize) -> Vec<SeedTarget> {
    if targets.is_empty() {
        return Vec::new();
    }
    let take = batch_size.clamp(1, targets.len());
    let offset = cursor % targets.len();
    (0..take)
        .map(|i| targets[(offset + i) % targets.len()].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn seed_lines_skip_comments_and_junk() {
        let targets = parse_seed_lines(
            "# QWERTZ seeds\nB005EOWBHC\n\nB00F34GN18  # Cherry Stream\nTOO_SHORT\nb07w6jn8v8\n",
        );
        let asins: Vec<&str> = targets.iter().map(|t| t.asin.as_str()).collect();
        assert_eq!(asins, vec!["B005EOWBHC", "B00F34GN18", "B07W6JN8V8"]);
        assert!(targets.iter().all(|t| t.domain_id == 3));
    }

    #[test]
    fn inline_asins_accept_domain_suffixes() {
        let targets = parse_inline_asins("B005EOWBHC, B00F34GN18:4 ,bad,B0058UR5GS:77");
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].domain_id, 3);
        assert_eq!(targets[1].domain_id, 4);
        assert_eq!(targets[1].market, "FR");
        // Unknown domain ids collapse to the default marketplace.
        assert_eq!(targets[2].domain_id, 3);
    }

    #[test]
    fn targets_csv_is_parsed_by_header() {
        let dir = std::env::temp_dir().join("keeper-seeds-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("targets.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "asin,domain_id,market").unwrap();
        writeln!(file, "B005EOWBHC,3,DE").unwrap();
        writeln!(file, "B07W6JN8V8,8,IT").unwrap();

        let targets = load_targets_file(&path);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].domain_id, 8);
        assert_eq!(targets[1].market, "IT");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn defaults_kick_in_when_nothing_is_configured() {
        let mut source = SeedSource::new(&keeper_core::config::CollectorConfig {
            source_mode: "product_only".to_string(),
            seed_file: "/nonexistent/seeds.txt".to_string(),
            targets_file: "/nonexistent/targets.csv".to_string(),
            seed_asins: String::new(),
            scan_interval_seconds: 3600,
            scan_batch_size: 10,
        });
        let targets = source.resolve();
        assert_eq!(targets.len(), DEFAULT_SEED_ASINS.len());
        assert_eq!(targets[0].asin, "B005EOWBHC");
    }

    #[test]
    fn seed_file_cache_reuses_unchanged_mtime() {
        let dir = std::env::temp_dir().join("keeper-seeds-mtime");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("seeds.txt");
        std::fs::write(&path, "B005EOWBHC\n").unwrap();

        let mut source = SeedSource::new(&keeper_core::config::CollectorConfig {
            source_mode: "product_only".to_string(),
            seed_file: path.to_string_lossy().to_string(),
            targets_file: "/nonexistent/targets.csv".to_string(),
            seed_asins: String::new(),
            scan_interval_seconds: 3600,
            scan_batch_size: 10,
        });

        assert_eq!(source.resolve().len(), 1);
        assert!(source.seed_cache.is_some());

        // Unchanged file: resolution must come from the cache.
        let cached_mtime = source.seed_cache.as_ref().unwrap().0;
        assert_eq!(source.resolve().len(), 1);
        assert_eq!(source.seed_cache.as_ref().unwrap().0, cached_mtime);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn batch_selection_rotates_through_the_seed_set() {
        let targets: Vec<SeedTarget> = ["B005EOWBHC", "B00F34GN18", "B0058UR5GS"]
            .iter()
            .filter_map(|a| SeedTarget::new(a, 3))
            .collect();

        let first = select_batch(&targets, 2, 0);
        assert_eq!(first[0].asin, "B005EOWBHC");
        assert_eq!(first[1].asin, "B00F34GN18");

        let second = select_batch(&targets, 2, 2);
        assert_eq!(second[0].asin, "B0058UR5GS");
        assert_eq!(second[1].asin, "B005EOWBHC");

        assert!(select_batch(&[], 5, 0).is_empty());
    }
}
