//! Sharded enrichment orchestrator.
//!
//! This module drives the pipeline over monthly CSV partitions: it
//! selects the rows owned by this shard, decides which IPs need a
//! registry lookup, fans the results back out to every row sharing an
//! IP, appends the consensus columns, and writes each output file
//! atomically so readers only ever see complete files.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use csv::StringRecord;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::core::consensus::resolve;
use crate::core::filter::InfrastructureFilter;
use crate::core::lookup::LookupClient;
use crate::models::{Config, RdapResult};
use crate::utils::{normalize_country_code, parse_asn};

/// Columns appended to every output row
const EXTRA_COLUMNS: [&str; 8] = [
    "rdap_ok",
    "rdap_net_cc",
    "rdap_org",
    "rdap_cidr",
    "rir",
    "rdap_error",
    "country_consensus",
    "consensus_rule",
];

const PROGRESS_JOURNAL: &str = "_progress.jsonl";
const ERRORS_FILE: &str = "_errors.txt";

/// Errors that can occur while orchestrating a run
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("input directory not found: {0}")]
    MissingInputDir(PathBuf),
    #[error("no input CSV files under {0}")]
    NoInputs(PathBuf),
    #[error("missing required column: {0}")]
    MissingColumn(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Counters reported at the end of a run
#[derive(Debug, Default)]
pub struct RunSummary {
    pub files_assigned: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub rows_written: u64,
    pub fresh_lookups: u64,
}

/// One line of the progress journal
#[derive(Debug, Serialize)]
struct ProgressRecord {
    run_id: Uuid,
    file: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    at: DateTime<Utc>,
}

/// Whether this shard owns the given IP's rows. The hash is stable
/// across runs and processes, so N shards partition every input
/// exhaustively and disjointly.
pub fn owned_by_shard(ip: &str, shard_total: u32, shard_index: u32) -> bool {
    if shard_total <= 1 {
        return shard_index == 0;
    }
    crc32fast::hash(ip.as_bytes()) % shard_total == shard_index
}

/// Positions of the input columns the pipeline reads
struct ColumnMap {
    src: usize,
    countrycode: Option<usize>,
    asnum: Option<usize>,
    domain: Option<usize>,
    org: Vec<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Result<Self, OrchestratorError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|c| c.trim().eq_ignore_ascii_case(name))
        };
        // the source IP column is required; `target` is the honeypot
        // datasets' fallback name for it
        let src = find("src")
            .or_else(|| find("target"))
            .ok_or_else(|| OrchestratorError::MissingColumn("src (or target)".to_string()))?;
        let org = ["asorg", "org", "isp"]
            .iter()
            .filter_map(|name| find(name))
            .collect();
        Ok(Self {
            src,
            countrycode: find("countrycode"),
            asnum: find("asnum"),
            domain: find("domain"),
            org,
        })
    }

    fn ip<'a>(&self, record: &'a StringRecord) -> &'a str {
        record.get(self.src).unwrap_or("").trim()
    }

    fn country<'a>(&self, record: &'a StringRecord) -> &'a str {
        self.countrycode
            .and_then(|i| record.get(i))
            .unwrap_or("")
    }

    fn asn(&self, record: &StringRecord) -> Option<u32> {
        self.asnum
            .and_then(|i| record.get(i))
            .and_then(parse_asn)
    }

    fn domain<'a>(&self, record: &'a StringRecord) -> &'a str {
        self.domain.and_then(|i| record.get(i)).unwrap_or("")
    }

    fn org<'a>(&self, record: &'a StringRecord) -> &'a str {
        self.org
            .iter()
            .filter_map(|&i| record.get(i))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }
}

/// Drives the enrichment of all monthly partitions assigned to one shard
pub struct Orchestrator {
    config: Config,
    client: Arc<LookupClient>,
    filter: Option<InfrastructureFilter>,
    allowlist: HashSet<String>,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(config: Config, client: Arc<LookupClient>) -> Self {
        let filter = config.cdn_filter_enabled.then(|| {
            InfrastructureFilter::new(
                &config.cdn_asns,
                &config.cdn_org_keys,
                &config.cdn_domain_keys,
            )
        });
        let allowlist = config
            .country_allowlist
            .iter()
            .map(|cc| normalize_country_code(cc))
            .filter(|cc| !cc.is_empty())
            .collect();
        Self {
            config,
            client,
            filter,
            allowlist,
            run_id: Uuid::new_v4(),
        }
    }

    /// Process every input partition. Per-file failures are recorded
    /// and the run continues; structural misconfiguration (a missing
    /// required column) aborts immediately.
    pub async fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let cfg = &self.config;
        if !cfg.part_dir.is_dir() {
            return Err(OrchestratorError::MissingInputDir(cfg.part_dir.clone()));
        }
        let inputs = enumerate_inputs(&cfg.part_dir)?;
        if inputs.is_empty() {
            return Err(OrchestratorError::NoInputs(cfg.part_dir.clone()));
        }
        fs::create_dir_all(&cfg.out_dir)?;

        let mut summary = RunSummary {
            files_assigned: inputs.len(),
            ..RunSummary::default()
        };
        info!(
            "run {}: {} input file(s), shard {}/{}",
            self.run_id,
            inputs.len(),
            cfg.shard_index,
            cfg.shard_total
        );

        for input in &inputs {
            let rel = input
                .strip_prefix(&cfg.part_dir)
                .unwrap_or(input)
                .to_path_buf();
            let out_path = self.output_path(&rel);
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }

            if cfg.skip_if_exists && out_path.exists() {
                info!("skip {} (output exists)", rel.display());
                self.journal(&rel, "skip_exists", None, None);
                summary.files_skipped += 1;
                continue;
            }

            info!("processing {} -> {}", rel.display(), out_path.display());
            match self.process_file(input, &out_path).await {
                Ok((rows, fresh)) => {
                    counter!("files_processed_total", 1);
                    counter!("rows_written_total", rows);
                    self.journal(&rel, "ok", Some(rows), None);
                    summary.files_processed += 1;
                    summary.rows_written += rows;
                    summary.fresh_lookups += fresh;
                }
                Err(e @ OrchestratorError::MissingColumn(_)) => {
                    // a structurally unusable input means the dataset
                    // would come out silently incomplete
                    return Err(e);
                }
                Err(e) => {
                    counter!("files_failed_total", 1);
                    error!("{}: {}", rel.display(), e);
                    self.append_error_line(&format!("{}: {}", rel.display(), e));
                    self.journal(&rel, "error", None, Some(e.to_string()));
                    summary.files_failed += 1;
                }
            }
        }

        info!(
            "run {} done: processed={} skipped={} failed={} rows={} fresh_lookups={}",
            self.run_id,
            summary.files_processed,
            summary.files_skipped,
            summary.files_failed,
            summary.rows_written,
            summary.fresh_lookups
        );
        Ok(summary)
    }

    /// Output path mirroring the input layout; shard runs get a
    /// distinct suffix so independent processes never collide.
    fn output_path(&self, rel: &Path) -> PathBuf {
        let cfg = &self.config;
        let mut out = cfg.out_dir.join(rel);
        if cfg.shard_total > 1 {
            let stem = out
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("out")
                .to_string();
            out.set_file_name(format!(
                "{}.shard{}-of-{}.csv",
                stem, cfg.shard_index, cfg.shard_total
            ));
        }
        out
    }

    /// Enrich one input partition and write it atomically
    async fn process_file(
        &self,
        input: &Path,
        out_path: &Path,
    ) -> Result<(u64, u64), OrchestratorError> {
        let cfg = &self.config;
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(input)?;
        let headers = reader.headers()?.clone();
        let cols = ColumnMap::from_headers(&headers)?;

        // rows owned by this shard
        let mut rows: Vec<StringRecord> = Vec::new();
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!("{}: skipping unreadable row: {}", input.display(), e);
                    continue;
                }
            };
            if owned_by_shard(cols.ip(&record), cfg.shard_total, cfg.shard_index) {
                rows.push(record);
            }
        }

        // distinct lookup candidates, in a stable order so the lookup
        // budget trims deterministically
        let mut candidates: BTreeSet<String> = BTreeSet::new();
        for record in &rows {
            let ip = cols.ip(record);
            if ip.is_empty() {
                continue;
            }
            if let Some(filter) = &self.filter {
                if filter.is_infrastructure(cols.asn(record), cols.org(record), cols.domain(record))
                {
                    continue;
                }
            }
            if !self.allowlist.is_empty() {
                let cc = normalize_country_code(cols.country(record));
                if !self.allowlist.contains(&cc) {
                    continue;
                }
            }
            candidates.insert(ip.to_string());
        }

        // split candidates into cache-served and fresh queries
        let mut resolved: HashMap<String, RdapResult> = HashMap::new();
        let mut to_query: Vec<String> = Vec::new();
        for ip in &candidates {
            match self.client.cached_final(ip) {
                Some(hit) => {
                    resolved.insert(ip.clone(), hit);
                }
                None => to_query.push(ip.clone()),
            }
        }
        if cfg.lookup_budget > 0 && to_query.len() > cfg.lookup_budget {
            warn!(
                "{}: lookup budget {} trims {} candidate(s)",
                input.display(),
                cfg.lookup_budget,
                to_query.len() - cfg.lookup_budget
            );
            to_query.truncate(cfg.lookup_budget);
        }
        let fresh = to_query.len() as u64;
        if fresh > 0 {
            info!(
                "{}: {} row(s), {} unique candidate(s), {} fresh lookup(s)",
                input.display(),
                rows.len(),
                candidates.len(),
                fresh
            );
        }

        // one lookup per distinct IP, on a bounded worker pool
        let results: Vec<(String, RdapResult)> = stream::iter(to_query.into_iter().map(|ip| {
            let client = Arc::clone(&self.client);
            async move {
                let result = client.lookup(&ip).await;
                (ip, result)
            }
        }))
        .buffer_unordered(cfg.workers)
        .collect()
        .await;
        for (ip, result) in results {
            resolved.insert(ip, result);
        }

        // budget-trimmed candidates still reuse whatever the cache has
        for ip in &candidates {
            if !resolved.contains_key(ip) {
                if let Some(stale) = self.client.cached(ip) {
                    resolved.insert(ip.clone(), stale);
                }
            }
        }

        self.write_atomic(out_path, &headers, &rows, &cols, &resolved)
            .map(|written| (written, fresh))
    }

    /// Write the enriched rows to `<final>.tmp`, then rename into place
    /// only after the write completed fully.
    fn write_atomic(
        &self,
        out_path: &Path,
        headers: &StringRecord,
        rows: &[StringRecord],
        cols: &ColumnMap,
        resolved: &HashMap<String, RdapResult>,
    ) -> Result<u64, OrchestratorError> {
        let tmp = PathBuf::from(format!("{}.tmp", out_path.display()));
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&tmp)?;

        let mut out_headers = headers.clone();
        for column in EXTRA_COLUMNS {
            out_headers.push_field(column);
        }
        writer.write_record(&out_headers)?;

        let mut written = 0u64;
        for record in rows {
            let rdap = resolved.get(cols.ip(record));
            let (consensus, rule) = resolve(cols.country(record), rdap);

            let mut out = record.clone();
            out.push_field(rdap.map(|r| if r.ok { "true" } else { "false" }).unwrap_or(""));
            out.push_field(rdap.and_then(|r| r.net_cc.as_deref()).unwrap_or(""));
            out.push_field(rdap.and_then(|r| r.org.as_deref()).unwrap_or(""));
            out.push_field(rdap.and_then(|r| r.cidr.as_deref()).unwrap_or(""));
            out.push_field(rdap.and_then(|r| r.rir.as_deref()).unwrap_or(""));
            out.push_field(rdap.and_then(|r| r.error.as_deref()).unwrap_or(""));
            out.push_field(&consensus);
            out.push_field(rule.as_str());
            writer.write_record(&out)?;
            written += 1;
        }

        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, out_path)?;
        Ok(written)
    }

    /// Best-effort append to the progress journal
    fn journal(&self, rel: &Path, status: &'static str, rows: Option<u64>, err: Option<String>) {
        let record = ProgressRecord {
            run_id: self.run_id,
            file: rel.display().to_string(),
            status,
            rows,
            error: err,
            at: Utc::now(),
        };
        let path = self.config.out_dir.join(PROGRESS_JOURNAL);
        if let Err(e) = append_jsonl(&path, &record) {
            warn!("failed to append progress journal: {}", e);
        }
    }

    /// Best-effort append to the errors file
    fn append_error_line(&self, msg: &str) {
        let path = self.config.out_dir.join(ERRORS_FILE);
        let append = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", msg)
        };
        if let Err(e) = append() {
            warn!("failed to append errors file: {}", e);
        }
    }
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(record)?)
}

/// Find input partitions: `part_dir/YYYY/*.csv` preferred, flat
/// `part_dir/*.csv` as fallback, both in sorted order.
fn enumerate_inputs(part_dir: &Path) -> Result<Vec<PathBuf>, OrchestratorError> {
    let mut year_dirs: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(part_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            year_dirs.push(path);
        }
    }
    year_dirs.sort();

    let mut inputs: Vec<PathBuf> = Vec::new();
    for dir in &year_dirs {
        inputs.extend(csv_files_in(dir)?);
    }
    if inputs.is_empty() {
        inputs = csv_files_in(part_dir)?;
    }
    Ok(inputs)
}

fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>, OrchestratorError> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "csv").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::RdapCache;
    use crate::core::lookup::{
        MockRdapTransport, RdapAnswer, RdapCidr, RdapNetwork, ReusePolicy,
    };
    use crate::core::rate_limiter::RateLimiter;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn test_shard_partition_is_exhaustive_and_disjoint() {
        let total = 4u32;
        for i in 0..200 {
            let ip = format!("10.0.{}.{}", i / 250, i % 250);
            let owners: Vec<u32> = (0..total)
                .filter(|&idx| owned_by_shard(&ip, total, idx))
                .collect();
            assert_eq!(owners.len(), 1, "ip {} owned by {:?}", ip, owners);
            // stable across repeated calls
            assert!(owned_by_shard(&ip, total, owners[0]));
        }
    }

    #[test]
    fn test_single_shard_owns_everything() {
        assert!(owned_by_shard("1.2.3.4", 1, 0));
        assert!(owned_by_shard("", 1, 0));
    }

    fn ua_answer() -> RdapAnswer {
        RdapAnswer {
            network: RdapNetwork {
                handle: None,
                name: Some("UA-NET".to_string()),
                country: Some("UA".to_string()),
                start_address: None,
                end_address: None,
                cidrs: vec![RdapCidr {
                    v4prefix: Some("198.51.100.0".to_string()),
                    v6prefix: None,
                    length: Some(24),
                }],
            },
            registry: Some("ripe".to_string()),
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Config,
    }

    fn fixture(rows: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let part_dir = dir.path().join("part");
        fs::create_dir_all(part_dir.join("2022")).unwrap();
        let mut file = fs::File::create(part_dir.join("2022/2022-01.csv")).unwrap();
        writeln!(file, "src,countrycode,asnum,asorg,domain").unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }

        let config = Config {
            part_dir,
            out_dir: dir.path().join("out"),
            cache_path: dir.path().join("cache.jsonl"),
            workers: 4,
            qps: 1000.0,
            burst: 1000,
            max_attempts: 3,
            ..Config::default()
        };
        Fixture { _dir: dir, config }
    }

    fn client_for(config: &Config, transport: MockRdapTransport) -> Arc<LookupClient> {
        let cache = Arc::new(RdapCache::open(&config.cache_path).unwrap());
        Arc::new(LookupClient::new(
            Box::new(transport),
            RateLimiter::new(config.qps, config.burst),
            cache,
            ReusePolicy {
                retry_failed: true,
                retry_empty_country: true,
            },
            config.max_attempts,
        ))
    }

    fn read_output(path: &Path) -> (StringRecord, Vec<StringRecord>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let rows = reader.records().map(|r| r.unwrap()).collect();
        (headers, rows)
    }

    #[tokio::test]
    async fn test_end_to_end_enrichment() {
        let fixture = fixture(&[
            "198.51.100.7,RU,12389,Rostelecom,example.ru",
            "198.51.100.7,RU,12389,Rostelecom,example.ru",
            "203.0.113.5,,64512,SomeOrg,host.example",
            "192.0.2.9,UA,13335,Cloudflare Inc,cdn.cloudflare.net",
        ]);

        let mut transport = MockRdapTransport::new();
        // two distinct non-infrastructure IPs, one lookup each
        transport
            .expect_fetch()
            .times(2)
            .returning(|_| Ok(ua_answer()));

        let orchestrator =
            Orchestrator::new(fixture.config.clone(), client_for(&fixture.config, transport));
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.rows_written, 4);
        assert_eq!(summary.fresh_lookups, 2);

        let out_path = fixture.config.out_dir.join("2022/2022-01.csv");
        let (headers, rows) = read_output(&out_path);
        assert_eq!(headers.len(), 5 + EXTRA_COLUMNS.len());
        let col = |name: &str| headers.iter().position(|h| h == name).unwrap();

        // duplicate IP rows share the single lookup result
        for row in &rows[0..2] {
            assert_eq!(row.get(col("rdap_ok")).unwrap(), "true");
            assert_eq!(row.get(col("rdap_net_cc")).unwrap(), "UA");
            assert_eq!(row.get(col("country_consensus")).unwrap(), "UA");
            assert_eq!(row.get(col("consensus_rule")).unwrap(), "disagree-prefer-rdap");
        }

        // unknown GeoIP country, registry answer wins
        assert_eq!(rows[2].get(col("country_consensus")).unwrap(), "UA");
        assert_eq!(rows[2].get(col("consensus_rule")).unwrap(), "rdap-only");

        // infrastructure row never reached the registry
        assert_eq!(rows[3].get(col("rdap_ok")).unwrap(), "");
        assert_eq!(rows[3].get(col("country_consensus")).unwrap(), "UA");
        assert_eq!(rows[3].get(col("consensus_rule")).unwrap(), "geoip-only");

        // no temp file left behind, journal written
        assert!(!fixture
            .config
            .out_dir
            .join("2022/2022-01.csv.tmp")
            .exists());
        assert!(fixture.config.out_dir.join(PROGRESS_JOURNAL).exists());
    }

    #[tokio::test]
    async fn test_skip_if_exists_rerun_reuses_output_and_cache() {
        let fixture = fixture(&["198.51.100.7,RU,12389,Rostelecom,example.ru"]);

        let mut transport = MockRdapTransport::new();
        transport
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(ua_answer()));
        let orchestrator =
            Orchestrator::new(fixture.config.clone(), client_for(&fixture.config, transport));
        orchestrator.run().await.unwrap();

        // second run: output exists, no lookups at all
        let mut idle = MockRdapTransport::new();
        idle.expect_fetch().never();
        let rerun = Orchestrator::new(fixture.config.clone(), client_for(&fixture.config, idle));
        let summary = rerun.run().await.unwrap();

        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_processed, 0);

        // the cache log survived and still holds the lookup
        let cache = RdapCache::open(&fixture.config.cache_path).unwrap();
        assert!(cache.get("198.51.100.7").unwrap().ok);
    }

    #[tokio::test]
    async fn test_missing_required_column_aborts_the_run() {
        let dir = TempDir::new().unwrap();
        let part_dir = dir.path().join("part");
        fs::create_dir_all(&part_dir).unwrap();
        let mut file = fs::File::create(part_dir.join("2022-01.csv")).unwrap();
        writeln!(file, "foo,bar").unwrap();
        writeln!(file, "1,2").unwrap();

        let config = Config {
            part_dir,
            out_dir: dir.path().join("out"),
            cache_path: dir.path().join("cache.jsonl"),
            ..Config::default()
        };

        let mut transport = MockRdapTransport::new();
        transport.expect_fetch().never();
        let orchestrator = Orchestrator::new(config.clone(), client_for(&config, transport));

        let result = orchestrator.run().await;
        assert!(matches!(result, Err(OrchestratorError::MissingColumn(_))));
    }

    #[tokio::test]
    async fn test_country_allowlist_restricts_candidates() {
        let fixture = fixture(&[
            "198.51.100.7,RU,12389,Rostelecom,example.ru",
            "203.0.113.5,DE,64512,SomeOrg,host.example",
        ]);
        let config = Config {
            country_allowlist: vec!["RU".to_string(), "UA".to_string()],
            ..fixture.config.clone()
        };

        let mut transport = MockRdapTransport::new();
        // only the RU row is a candidate
        transport
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(ua_answer()));

        let orchestrator = Orchestrator::new(config.clone(), client_for(&config, transport));
        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.fresh_lookups, 1);
        assert_eq!(summary.rows_written, 2);
    }

    #[test]
    fn test_sharded_output_path_gets_a_distinct_suffix() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            out_dir: dir.path().join("out"),
            cache_path: dir.path().join("cache.jsonl"),
            shard_total: 4,
            shard_index: 2,
            ..Config::default()
        };
        let mut transport = MockRdapTransport::new();
        transport.expect_fetch().never();
        let orchestrator = Orchestrator::new(config.clone(), client_for(&config, transport));

        let out = orchestrator.output_path(Path::new("2022/2022-01.csv"));
        assert_eq!(
            out,
            config.out_dir.join("2022/2022-01.shard2-of-4.csv")
        );
    }
}
