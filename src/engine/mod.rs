use crate::catalog::{DataType, IndexBinding, MediaKind, Schema, TableMeta, META_FILE};
use crate::config::{
    BTreeConfig, HashConfig, IsamConfig, Language, MediaConfig, RTreeConfig, SequentialConfig,
    SpimiConfig,
};
use crate::error::{OmnidexError, OmnidexResult};
use crate::index::btree::BPlusTreeIndex;
use crate::index::hash::ExtendibleHashIndex;
use crate::index::isam::IsamIndex;
use crate::index::rtree::{Metric, RTreeIndex};
use crate::index::sequential::SequentialIndex;
use crate::index::{EntryCodec, IndexKind, Key, KeyIndex};
use crate::ingest::{collect_rows, infer_schema, synthetic_rows, CsvSource};
use crate::media::{Codebook, Descriptors, FeatureExtractor, MediaIndex, SearchMethod};
use crate::sql::{self, parse_point, Literal, Predicate, SpatialParam, Statement};
use crate::storage::{RecordFile, Rid, RECORD_FILE};
use crate::text::TextIndex;
use crate::utils::cancel::CancelToken;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `LIMIT` when the statement does not say.
pub const DEFAULT_LIMIT: usize = 10;

/// The result of one statement: column names, projected rows, the affected
/// or returned row count, and wall time.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub count: usize,
    pub elapsed: Duration,
}

impl QueryOutput {
    fn rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        QueryOutput {
            columns,
            count: rows.len(),
            rows,
            elapsed: Duration::ZERO,
        }
    }

    fn affected(count: usize) -> Self {
        QueryOutput {
            columns: Vec::new(),
            rows: Vec::new(),
            count,
            elapsed: Duration::ZERO,
        }
    }
}

/// One table's live state: manifest, record store and its primary index.
/// Guarded by the handle's shared/exclusive lock.
struct Table {
    dir: PathBuf,
    meta: TableMeta,
    records: RecordFile,
    index: TableIndex,
}

enum TableIndex {
    Keyed(Box<dyn KeyIndex>),
    Spatial(RTreeIndex),
    Text(TextIndex),
    Media(MediaIndex),
}

struct TableHandle {
    state: RwLock<Table>,
}

/// The engine: a process-wide dictionary of tables, a registry of feature
/// extractors, and the SQL dispatch that binds parsed statements to the
/// index structures. Queries take a table's lock shared; CREATE, INSERT
/// and DELETE take it exclusive.
pub struct Engine {
    base_dir: PathBuf,
    tables: DashMap<String, Arc<TableHandle>>,
    extractors: RwLock<HashMap<(MediaKind, String), Arc<dyn FeatureExtractor>>>,
}

impl Engine {
    /// Open an engine rooted at `base_dir`, reopening every table directory
    /// that carries a manifest.
    pub fn open(base_dir: impl Into<PathBuf>) -> OmnidexResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        let engine = Engine {
            base_dir: base_dir.clone(),
            tables: DashMap::new(),
            extractors: RwLock::new(HashMap::new()),
        };
        for entry in fs::read_dir(&base_dir)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(META_FILE).exists() {
                continue;
            }
            match Table::open(&dir) {
                Ok(table) => {
                    debug!("reopened table \"{}\"", table.meta.name);
                    engine.tables.insert(
                        table.meta.name.clone(),
                        Arc::new(TableHandle {
                            state: RwLock::new(table),
                        }),
                    );
                }
                Err(err) => warn!("skipping table at {:?}: {}", dir, err),
            }
        }
        Ok(engine)
    }

    /// Register the feature extractor serving `method` for a media family.
    pub fn register_extractor(
        &self,
        media: MediaKind,
        method: impl Into<String>,
        extractor: Arc<dyn FeatureExtractor>,
    ) {
        self.extractors
            .write()
            .insert((media, method.into().to_ascii_lowercase()), extractor);
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|e| e.key().clone()).collect()
    }

    pub fn execute(&self, sql_text: &str) -> OmnidexResult<QueryOutput> {
        self.execute_with_cancel(sql_text, None)
    }

    pub fn execute_with_cancel(
        &self,
        sql_text: &str,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<QueryOutput> {
        let start = Instant::now();
        let statement = sql::parse(sql_text)?;
        let mut output = match statement {
            Statement::CreateTable {
                name,
                source,
                kind,
                fields,
            } => self.create_table(name, &source, kind, fields),
            Statement::CreateMultimediaTable {
                name,
                source,
                media,
                method,
                clusters,
            } => self.create_multimedia_table(name, &source, media, &method, clusters),
            Statement::Select {
                projection,
                table,
                predicate,
                limit,
            } => self.select(projection, &table, predicate, limit, cancel),
            Statement::Insert { table, values } => self.insert(&table, values),
            Statement::GenerateData { table, count } => self.generate_data(&table, count),
            Statement::Delete {
                table,
                field,
                value,
            } => self.delete(&table, &field, value, cancel),
            Statement::DropTable { name } => self.drop_table(&name),
        }?;
        output.elapsed = start.elapsed();
        Ok(output)
    }

    fn handle(&self, table: &str) -> OmnidexResult<Arc<TableHandle>> {
        self.tables
            .get(table)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OmnidexError::UnknownTable(table.to_string()))
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn create_table(
        &self,
        name: String,
        source: &str,
        kind: IndexKind,
        fields: Vec<String>,
    ) -> OmnidexResult<QueryOutput> {
        if self.tables.contains_key(&name) {
            return Err(OmnidexError::Build(format!(
                "table \"{}\" already exists",
                name
            )));
        }
        let mut csv = CsvSource::open(Path::new(source))?;
        let (headers, rows) = collect_rows(&mut csv)?;
        let schema = infer_schema(&headers, &rows);
        for field in &fields {
            schema.index_of(field)?;
        }
        validate_binding(kind, &fields, &schema)?;

        let dir = self.table_dir(&name);
        if dir.join(META_FILE).exists() {
            return Err(OmnidexError::Build(format!(
                "artifacts for \"{}\" already exist at {:?}",
                name, dir
            )));
        }
        fs::create_dir_all(&dir)?;

        let widths: Vec<usize> = schema.columns.iter().map(|c| c.width).collect();
        let records = RecordFile::create(&dir.join(RECORD_FILE), widths)?;
        let mut stored: Vec<(Rid, Vec<String>)> = Vec::with_capacity(rows.len());
        for row in rows {
            let rid = records.append(&row)?;
            stored.push((rid, row));
        }
        records.sync()?;

        // Only extendible hash may enforce uniqueness, and it does by default.
        let unique = kind == IndexKind::Hash;
        let binding = IndexBinding {
            kind,
            fields: fields.clone(),
            unique,
            geographic: kind == IndexKind::RTree && looks_geographic(&fields, &schema),
        };
        let meta = TableMeta {
            name: name.clone(),
            schema: schema.clone(),
            index: binding,
            language: (kind == IndexKind::Spimi).then(Language::default),
            media: None,
            clusters: None,
            extractor: None,
        };

        let index = build_index(&dir, &meta, &stored)?;
        meta.save(&dir)?;
        debug!(
            "created table \"{}\" with {} rows, {} index on {:?}",
            name,
            stored.len(),
            kind,
            fields
        );

        let count = stored.len();
        let table = Table {
            dir,
            meta,
            records,
            index,
        };
        self.tables.insert(
            name,
            Arc::new(TableHandle {
                state: RwLock::new(table),
            }),
        );
        Ok(QueryOutput::affected(count))
    }

    fn create_multimedia_table(
        &self,
        name: String,
        source: &str,
        media: MediaKind,
        method: &str,
        clusters: usize,
    ) -> OmnidexResult<QueryOutput> {
        if self.tables.contains_key(&name) {
            return Err(OmnidexError::Build(format!(
                "table \"{}\" already exists",
                name
            )));
        }
        let extractor = self.lookup_extractor(media, method)?;

        let mut csv = CsvSource::open(Path::new(source))?;
        let (headers, rows) = collect_rows(&mut csv)?;
        let schema = infer_schema(&headers, &rows);
        let path_field = find_path_field(&schema)?;
        let path_idx = schema.index_of(&path_field)?;

        let dir = self.table_dir(&name);
        if dir.join(META_FILE).exists() {
            return Err(OmnidexError::Build(format!(
                "artifacts for \"{}\" already exist at {:?}",
                name, dir
            )));
        }
        fs::create_dir_all(&dir)?;

        let widths: Vec<usize> = schema.columns.iter().map(|c| c.width).collect();
        let records = RecordFile::create(&dir.join(RECORD_FILE), widths)?;
        let mut assets: Vec<(Rid, Descriptors)> = Vec::with_capacity(rows.len());
        for row in rows {
            let rid = records.append(&row)?;
            let asset_path = row.get(path_idx).cloned().unwrap_or_default();
            let descriptors = extractor.extract(Path::new(asset_path.trim()))?;
            assets.push((rid, descriptors));
        }
        records.sync()?;

        let codebook = train_codebook(&assets, clusters)?;
        let index = MediaIndex::build(&dir, codebook, assets)?;

        let meta = TableMeta {
            name: name.clone(),
            schema,
            index: IndexBinding {
                kind: IndexKind::Media,
                fields: vec![path_field],
                unique: false,
                geographic: false,
            },
            language: None,
            media: Some(media),
            clusters: Some(clusters),
            extractor: Some(extractor.id()),
        };
        meta.save(&dir)?;
        debug!(
            "created multimedia table \"{}\" ({} assets, {} clusters)",
            name,
            index.live_assets(),
            clusters
        );

        let count = index.live_assets() as usize;
        let table = Table {
            dir,
            meta,
            records,
            index: TableIndex::Media(index),
        };
        self.tables.insert(
            name,
            Arc::new(TableHandle {
                state: RwLock::new(table),
            }),
        );
        Ok(QueryOutput::affected(count))
    }

    fn lookup_extractor(
        &self,
        media: MediaKind,
        method: &str,
    ) -> OmnidexResult<Arc<dyn FeatureExtractor>> {
        self.extractors
            .read()
            .get(&(media, method.to_ascii_lowercase()))
            .cloned()
            .ok_or_else(|| {
                OmnidexError::Build(format!(
                    "no feature extractor registered for {:?} method \"{}\"",
                    media, method
                ))
            })
    }

    fn select(
        &self,
        projection: Option<Vec<String>>,
        table: &str,
        predicate: Option<Predicate>,
        limit: Option<usize>,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<QueryOutput> {
        let handle = self.handle(table)?;
        // Media queries need the extractor; resolve it outside the lock.
        let extractor = {
            let state = handle.state.read();
            match (&state.index, &predicate) {
                (TableIndex::Media(_), Some(Predicate::Similar { .. })) => {
                    let media = state.meta.media.ok_or_else(|| {
                        OmnidexError::Internal("media table without media kind".to_string())
                    })?;
                    let id = state.meta.extractor.clone().ok_or_else(|| {
                        OmnidexError::Internal("media table without extractor id".to_string())
                    })?;
                    let extractor = self.lookup_extractor(media, &id.name)?;
                    if extractor.id() != id {
                        return Err(OmnidexError::Build(format!(
                            "extractor identity mismatch: table built with {:?}, registered {:?}",
                            id,
                            extractor.id()
                        )));
                    }
                    Some(extractor)
                }
                _ => None,
            }
        };

        let state = handle.state.read();
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        let (matches, score_column) = evaluate_predicate(&state, predicate, limit, extractor, cancel)?;

        let schema = &state.meta.schema;
        let indices = match &projection {
            None => (0..schema.column_count()).collect::<Vec<_>>(),
            Some(fields) => fields
                .iter()
                .map(|f| schema.index_of(f))
                .collect::<OmnidexResult<Vec<_>>>()?,
        };
        let mut columns: Vec<String> = indices
            .iter()
            .map(|i| schema.columns[*i].name.clone())
            .collect();
        if let Some(name) = score_column {
            columns.push(name.to_string());
        }

        let mut rows = Vec::new();
        for (rid, score) in matches.into_iter().take(limit) {
            let Some(fields) = state.records.read(rid)? else {
                warn!("index surfaced tombstoned rid {} in \"{}\"", rid, table);
                continue;
            };
            let mut row: Vec<String> = indices
                .iter()
                .map(|i| fields.get(*i).cloned().unwrap_or_default())
                .collect();
            if let Some(score) = score {
                row.push(format!("{:.6}", score));
            }
            rows.push(row);
        }
        Ok(QueryOutput::rows(columns, rows))
    }

    fn insert(&self, table: &str, values: Vec<String>) -> OmnidexResult<QueryOutput> {
        let handle = self.handle(table)?;
        let extractor = self.extractor_if_media(&handle)?;
        let mut state = handle.state.write();
        let table_ref = &mut *state;
        insert_row(table_ref, extractor.as_deref(), &values)?;
        Ok(QueryOutput::affected(1))
    }

    fn generate_data(&self, table: &str, count: usize) -> OmnidexResult<QueryOutput> {
        let handle = self.handle(table)?;
        let extractor = self.extractor_if_media(&handle)?;
        let mut state = handle.state.write();
        let table_ref = &mut *state;
        let start = table_ref.records.len();
        let rows = synthetic_rows(&table_ref.meta.schema, count, start);
        for row in &rows {
            insert_row(table_ref, extractor.as_deref(), row)?;
        }
        Ok(QueryOutput::affected(rows.len()))
    }

    fn extractor_if_media(
        &self,
        handle: &TableHandle,
    ) -> OmnidexResult<Option<Arc<dyn FeatureExtractor>>> {
        let state = handle.state.read();
        match (&state.index, state.meta.media, &state.meta.extractor) {
            (TableIndex::Media(_), Some(media), Some(id)) => {
                let extractor = self.lookup_extractor(media, &id.name)?;
                if extractor.id() != *id {
                    return Err(OmnidexError::Build(format!(
                        "extractor identity mismatch: table built with {:?}, registered {:?}",
                        id,
                        extractor.id()
                    )));
                }
                Ok(Some(extractor))
            }
            _ => Ok(None),
        }
    }

    fn delete(
        &self,
        table: &str,
        field: &str,
        value: Literal,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<QueryOutput> {
        let handle = self.handle(table)?;
        let mut state = handle.state.write();
        let table_ref = &mut *state;
        let schema = &table_ref.meta.schema;
        let field_idx = schema.index_of(field)?;

        // Fast path: the predicate field is the primary key field.
        if is_key_field(&table_ref.meta, field) {
            let removed = match &mut table_ref.index {
                TableIndex::Keyed(index) => {
                    let key = parse_key(schema, field, value.as_str())?;
                    let rids = index.delete(&key)?;
                    index.persist()?;
                    rids
                }
                TableIndex::Spatial(rtree) if table_ref.meta.index.fields.len() == 1 => {
                    let point = parse_point(value.as_str())?;
                    let rids = rtree.delete_point(point);
                    rtree.persist()?;
                    rids
                }
                // Text/media tables and per-coordinate spatial deletes
                // fall through to the scan below.
                _ => Vec::new(),
            };
            let handled = match &table_ref.index {
                TableIndex::Keyed(_) => true,
                TableIndex::Spatial(_) => table_ref.meta.index.fields.len() == 1,
                _ => false,
            };
            if handled {
                for rid in &removed {
                    table_ref.records.tombstone(*rid)?;
                }
                return Ok(QueryOutput::affected(removed.len()));
            }
        }

        // Full scan + filter for non-key fields (and text/media tables).
        let target = Key::parse(value.as_str(), schema.columns[field_idx].data_type).ok();
        let mut victims: Vec<(Rid, Vec<String>)> = Vec::new();
        for item in table_ref.records.scan() {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            let (rid, fields) = item?;
            if field_matches(&fields, field_idx, schema.columns[field_idx].data_type, &target, value.as_str()) {
                victims.push((rid, fields));
            }
        }
        let victim_set: HashSet<Rid> = victims.iter().map(|(rid, _)| *rid).collect();
        for (rid, _) in &victims {
            table_ref.records.tombstone(*rid)?;
        }
        match &mut table_ref.index {
            TableIndex::Keyed(index) => {
                for (_, fields) in &victims {
                    let key = key_of_row(&table_ref.meta, fields)?;
                    let unlinked = index.delete(&key)?;
                    // A shared key may cover rows the predicate did not
                    // match; those entries go back in.
                    for rid in unlinked {
                        if !victim_set.contains(&rid) {
                            index.insert(key.clone(), rid)?;
                        }
                    }
                }
                index.persist()?;
            }
            TableIndex::Spatial(rtree) => {
                for (_, fields) in &victims {
                    let point = point_of_row(&table_ref.meta, fields)?;
                    let unlinked = rtree.delete_point(point);
                    for rid in unlinked {
                        if !victim_set.contains(&rid) {
                            rtree.insert_point(point, rid);
                        }
                    }
                }
                rtree.persist()?;
            }
            TableIndex::Text(text) => {
                for (rid, _) in &victims {
                    text.remove(*rid)?;
                }
            }
            TableIndex::Media(media) => {
                for (rid, _) in &victims {
                    media.remove(*rid);
                }
                media.persist()?;
            }
        }
        Ok(QueryOutput::affected(victims.len()))
    }

    fn drop_table(&self, name: &str) -> OmnidexResult<QueryOutput> {
        let Some((_, handle)) = self.tables.remove(name) else {
            return Err(OmnidexError::UnknownTable(name.to_string()));
        };
        let state = handle.state.write();
        fs::remove_dir_all(&state.dir)?;
        debug!("dropped table \"{}\"", name);
        Ok(QueryOutput::affected(0))
    }
}

impl Table {
    fn open(dir: &Path) -> OmnidexResult<Self> {
        let meta = TableMeta::load(dir)?;
        let widths: Vec<usize> = meta.schema.columns.iter().map(|c| c.width).collect();
        let records = RecordFile::open(&dir.join(RECORD_FILE), widths)?;
        let index = match meta.index.kind {
            IndexKind::Sequential => TableIndex::Keyed(Box::new(SequentialIndex::open(
                dir,
                entry_codec(&meta)?,
                SequentialConfig::default(),
                meta.index.unique,
            )?)),
            IndexKind::Isam => TableIndex::Keyed(Box::new(IsamIndex::open(
                dir,
                entry_codec(&meta)?,
                IsamConfig::default(),
                meta.index.unique,
            )?)),
            IndexKind::Hash => TableIndex::Keyed(Box::new(ExtendibleHashIndex::open(
                dir,
                entry_codec(&meta)?,
                HashConfig {
                    unique: meta.index.unique,
                    ..HashConfig::default()
                },
            )?)),
            IndexKind::BTree => TableIndex::Keyed(Box::new(BPlusTreeIndex::open(dir)?)),
            IndexKind::RTree => TableIndex::Spatial(RTreeIndex::open(dir)?),
            IndexKind::Spimi => TableIndex::Text(TextIndex::open(
                dir,
                SpimiConfig {
                    language: meta.language.unwrap_or_default(),
                    ..SpimiConfig::default()
                },
                meta.index.fields.clone(),
            )?),
            IndexKind::Media => TableIndex::Media(MediaIndex::open(dir)?),
        };
        Ok(Table {
            dir: dir.to_path_buf(),
            meta,
            records,
            index,
        })
    }
}

/// Insert one row into the table's record store and index; on index
/// rejection (e.g. duplicate key) the appended record is tombstoned so no
/// partial state survives.
fn insert_row(
    table: &mut Table,
    extractor: Option<&dyn FeatureExtractor>,
    values: &[String],
) -> OmnidexResult<Rid> {
    let rid = table.records.append(values)?;
    let result = (|| -> OmnidexResult<()> {
        match &mut table.index {
            TableIndex::Keyed(index) => {
                let key = key_of_row(&table.meta, values)?;
                index.insert(key, rid)?;
                index.persist()
            }
            TableIndex::Spatial(rtree) => {
                let point = point_of_row(&table.meta, values)?;
                rtree.insert_point(point, rid);
                rtree.persist()
            }
            TableIndex::Text(text) => {
                let field_values = text_field_values(&table.meta, values)?;
                text.insert(rid, &field_values)
            }
            TableIndex::Media(media) => {
                let extractor = extractor.ok_or_else(|| {
                    OmnidexError::Internal("media insert without extractor".to_string())
                })?;
                let path_idx = table.meta.schema.index_of(&table.meta.index.fields[0])?;
                let asset_path = values.get(path_idx).cloned().unwrap_or_default();
                let descriptors = extractor.extract(Path::new(asset_path.trim()))?;
                media.insert(rid, &descriptors)?;
                media.persist()
            }
        }
    })();
    if let Err(err) = result {
        table.records.tombstone(rid)?;
        return Err(err);
    }
    Ok(rid)
}

/// Evaluate a SELECT predicate to `(rid, score)` matches in result order,
/// plus the name of the score column for ranked predicates.
fn evaluate_predicate(
    table: &Table,
    predicate: Option<Predicate>,
    limit: usize,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    cancel: Option<&CancelToken>,
) -> OmnidexResult<(Vec<(Rid, Option<f64>)>, Option<&'static str>)> {
    let schema = &table.meta.schema;
    let Some(predicate) = predicate else {
        let rows = full_scan(table, cancel, |_| true)?;
        return Ok((rows, None));
    };

    match predicate {
        Predicate::Eq { field, value } => {
            let field_idx = schema.index_of(&field)?;
            if is_key_field(&table.meta, &field) {
                match &table.index {
                    TableIndex::Keyed(index) => {
                        let key = parse_key(schema, &field, value.as_str())?;
                        let rids = index.search(&key)?;
                        return Ok((rids.into_iter().map(|rid| (rid, None)).collect(), None));
                    }
                    // Point equality only makes sense against a single
                    // "lat,lon" field; per-coordinate equality scans.
                    TableIndex::Spatial(rtree) if table.meta.index.fields.len() == 1 => {
                        let point = parse_point(value.as_str())?;
                        let rids = rtree.search_point(point);
                        return Ok((rids.into_iter().map(|rid| (rid, None)).collect(), None));
                    }
                    // Equality over text/media bindings has no index
                    // semantics; fall through to the scan.
                    _ => {}
                }
            }
            let data_type = schema.columns[field_idx].data_type;
            let target = Key::parse(value.as_str(), data_type).ok();
            let raw = value.as_str().to_string();
            let rows = full_scan(table, cancel, |fields| {
                field_matches(fields, field_idx, data_type, &target, &raw)
            })?;
            Ok((rows, None))
        }

        Predicate::Between { field, lo, hi } => {
            let field_idx = schema.index_of(&field)?;
            if is_key_field(&table.meta, &field) {
                match &table.index {
                    TableIndex::Keyed(index) => {
                        if !index.supports_range() {
                            return Err(OmnidexError::UnsupportedPredicate(format!(
                                "BETWEEN over {} index on \"{}\"",
                                index.kind(),
                                field
                            )));
                        }
                        let lo = parse_key(schema, &field, lo.as_str())?;
                        let hi = parse_key(schema, &field, hi.as_str())?;
                        let entries = index.range(&lo, &hi)?;
                        return Ok((
                            entries.into_iter().map(|(_, rid)| (rid, None)).collect(),
                            None,
                        ));
                    }
                    _ => {
                        return Err(OmnidexError::UnsupportedPredicate(format!(
                            "BETWEEN over the {} binding on \"{}\"",
                            table.meta.index.kind, field
                        )));
                    }
                }
            }
            let data_type = schema.columns[field_idx].data_type;
            let lo = Key::parse(lo.as_str(), data_type)?;
            let hi = Key::parse(hi.as_str(), data_type)?;
            let mut rows = full_scan(table, cancel, |fields| {
                let Some(raw) = fields.get(field_idx) else {
                    return false;
                };
                match Key::parse(raw, data_type) {
                    Ok(key) => key >= lo && key <= hi,
                    Err(_) => false,
                }
            })?;
            // A scan has no key order; restore it for range semantics.
            rows.sort_by_cached_key(|(rid, _)| {
                table
                    .records
                    .read(*rid)
                    .ok()
                    .flatten()
                    .and_then(|fields| {
                        Key::parse(&fields[field_idx], data_type).ok()
                    })
            });
            Ok((rows, None))
        }

        Predicate::Spatial {
            field,
            point,
            param,
        } => {
            schema.index_of(&field)?;
            let TableIndex::Spatial(rtree) = &table.index else {
                return Err(OmnidexError::UnsupportedPredicate(format!(
                    "spatial IN over the {} index on \"{}\"",
                    table.meta.index.kind, field
                )));
            };
            if !is_key_field(&table.meta, &field) {
                return Err(OmnidexError::UnsupportedPredicate(format!(
                    "\"{}\" is not the spatial field of this table",
                    field
                )));
            }
            let hits = match param {
                SpatialParam::Radius(radius) => rtree.within_radius(point, radius, cancel)?,
                SpatialParam::Nearest(k) => rtree.knn(point, k, cancel)?,
            };
            Ok((
                hits.into_iter()
                    .map(|(rid, dist)| (rid, Some(dist)))
                    .collect(),
                Some("distance"),
            ))
        }

        Predicate::Match { field, query } => {
            schema.index_of(&field)?;
            let TableIndex::Text(text) = &table.index else {
                return Err(OmnidexError::UnsupportedPredicate(format!(
                    "@@ over the {} index on \"{}\"",
                    table.meta.index.kind, field
                )));
            };
            if !text
                .fields()
                .iter()
                .any(|f| f.eq_ignore_ascii_case(&field))
            {
                return Err(OmnidexError::UnsupportedPredicate(format!(
                    "\"{}\" is not a text field of this table",
                    field
                )));
            }
            let scope = (text.fields().len() > 1).then_some(field.as_str());
            let hits = text.query(scope, &query, limit, cancel)?;
            Ok((
                hits.into_iter()
                    .map(|(rid, score)| (rid, Some(score)))
                    .collect(),
                Some("score"),
            ))
        }

        Predicate::Similar {
            field,
            path,
            method,
        } => {
            schema.index_of(&field)?;
            let TableIndex::Media(media) = &table.index else {
                return Err(OmnidexError::UnsupportedPredicate(format!(
                    "<-> over the {} index on \"{}\"",
                    table.meta.index.kind, field
                )));
            };
            if !is_key_field(&table.meta, &field) {
                return Err(OmnidexError::UnsupportedPredicate(format!(
                    "\"{}\" is not the media field of this table",
                    field
                )));
            }
            let extractor = extractor.ok_or_else(|| {
                OmnidexError::Internal("similarity query without extractor".to_string())
            })?;
            let descriptors = extractor.extract(Path::new(&path))?;
            let query = media.histogram(&descriptors)?;
            let hits = media.knn(
                &query,
                limit,
                method.unwrap_or(SearchMethod::Inverted),
                cancel,
            )?;
            Ok((
                hits.into_iter()
                    .map(|(rid, score)| (rid, Some(score)))
                    .collect(),
                Some("similarity"),
            ))
        }
    }
}

fn full_scan(
    table: &Table,
    cancel: Option<&CancelToken>,
    mut keep: impl FnMut(&[String]) -> bool,
) -> OmnidexResult<Vec<(Rid, Option<f64>)>> {
    let mut out = Vec::new();
    for item in table.records.scan() {
        if let Some(token) = cancel {
            token.checkpoint()?;
        }
        let (rid, fields) = item?;
        if keep(&fields) {
            out.push((rid, None));
        }
    }
    Ok(out)
}

fn field_matches(
    fields: &[String],
    field_idx: usize,
    data_type: DataType,
    target: &Option<Key>,
    raw: &str,
) -> bool {
    let Some(value) = fields.get(field_idx) else {
        return false;
    };
    match target {
        Some(target_key) => match Key::parse(value, data_type) {
            Ok(key) => key == *target_key,
            Err(_) => value.trim() == raw.trim(),
        },
        None => value.trim() == raw.trim(),
    }
}

fn is_key_field(meta: &TableMeta, field: &str) -> bool {
    meta.index
        .fields
        .iter()
        .any(|f| f.eq_ignore_ascii_case(field))
}

fn parse_key(schema: &Schema, field: &str, raw: &str) -> OmnidexResult<Key> {
    let column = schema.column(field)?;
    Key::parse(raw, column.data_type)
}

fn key_of_row(meta: &TableMeta, fields: &[String]) -> OmnidexResult<Key> {
    let field = &meta.index.fields[0];
    let idx = meta.schema.index_of(field)?;
    let raw = fields.get(idx).map(String::as_str).unwrap_or("");
    parse_key(&meta.schema, field, raw)
}

/// The spatial point of a row: one geo2d field, or a lat/lon float pair.
fn point_of_row(meta: &TableMeta, fields: &[String]) -> OmnidexResult<[f64; 2]> {
    let binding = &meta.index.fields;
    if binding.len() == 1 {
        let idx = meta.schema.index_of(&binding[0])?;
        parse_point(fields.get(idx).map(String::as_str).unwrap_or(""))
    } else {
        let mut point = [0.0f64; 2];
        for (slot, field) in binding.iter().take(2).enumerate() {
            let idx = meta.schema.index_of(field)?;
            let raw = fields.get(idx).map(String::as_str).unwrap_or("");
            point[slot] = raw.trim().parse::<f64>().map_err(|_| {
                OmnidexError::Parse(format!("\"{}\" is not a coordinate", raw))
            })?;
        }
        Ok(point)
    }
}

fn text_field_values(meta: &TableMeta, fields: &[String]) -> OmnidexResult<Vec<String>> {
    meta.index
        .fields
        .iter()
        .map(|f| {
            let idx = meta.schema.index_of(f)?;
            Ok(fields.get(idx).cloned().unwrap_or_default())
        })
        .collect()
}

fn entry_codec(meta: &TableMeta) -> OmnidexResult<EntryCodec> {
    let column = meta.schema.column(&meta.index.fields[0])?;
    Ok(EntryCodec::new(column.data_type, column.width))
}

fn validate_binding(kind: IndexKind, fields: &[String], schema: &Schema) -> OmnidexResult<()> {
    match kind {
        IndexKind::Sequential | IndexKind::Isam | IndexKind::Hash | IndexKind::BTree => {
            if fields.len() != 1 {
                return Err(OmnidexError::Build(format!(
                    "{} index binds exactly one field",
                    kind
                )));
            }
        }
        IndexKind::RTree => {
            let ok = match fields.len() {
                1 => schema.column(&fields[0])?.data_type == DataType::Geo2d,
                2 => fields.iter().all(|f| {
                    matches!(
                        schema.column(f).map(|c| c.data_type),
                        Ok(DataType::Float) | Ok(DataType::Int)
                    )
                }),
                _ => false,
            };
            if !ok {
                return Err(OmnidexError::Build(
                    "rtree binds one \"lat,lon\" field or two numeric fields".to_string(),
                ));
            }
        }
        IndexKind::Spimi => {
            if fields.is_empty() {
                return Err(OmnidexError::Build(
                    "spimi binds at least one text field".to_string(),
                ));
            }
        }
        IndexKind::Media => {
            return Err(OmnidexError::Build(
                "media tables are created with CREATE MULTIMEDIA TABLE".to_string(),
            ));
        }
    }
    Ok(())
}

fn looks_geographic(fields: &[String], schema: &Schema) -> bool {
    let geo_name = |name: &str| {
        let name = name.to_ascii_lowercase();
        name.starts_with("lat") || name.starts_with("lon") || name.starts_with("lng")
    };
    match fields.len() {
        // A geo2d column is a lat/lon pair by construction; no name
        // heuristic needed.
        1 => schema
            .column(&fields[0])
            .map(|c| c.data_type == DataType::Geo2d)
            .unwrap_or(false),
        // A float pair carries no type signal, so the names decide.
        2 => fields.iter().all(|f| geo_name(f)),
        _ => false,
    }
}

fn find_path_field(schema: &Schema) -> OmnidexResult<String> {
    if let Some(column) = schema
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case("path"))
    {
        return Ok(column.name.clone());
    }
    schema
        .columns
        .iter()
        .find(|c| c.name.to_ascii_lowercase().contains("path"))
        .map(|c| c.name.clone())
        .ok_or_else(|| {
            OmnidexError::Build(
                "multimedia table needs a column naming the asset path".to_string(),
            )
        })
}

fn train_codebook(assets: &[(Rid, Descriptors)], clusters: usize) -> OmnidexResult<Codebook> {
    let mut local_sets: Vec<Vec<Vec<f32>>> = Vec::new();
    let mut global_dim: Option<usize> = None;
    for (_, descriptors) in assets {
        match descriptors {
            Descriptors::Local(set) => local_sets.push(set.clone()),
            Descriptors::Global(v) => global_dim = Some(v.len()),
        }
    }
    match (local_sets.is_empty(), global_dim) {
        (false, None) => Codebook::train(
            &local_sets,
            &MediaConfig {
                clusters,
                ..MediaConfig::default()
            },
        ),
        (true, Some(dim)) => Ok(Codebook::Identity { dim }),
        (true, None) => Err(OmnidexError::Build(
            "multimedia table has no assets to index".to_string(),
        )),
        (false, Some(_)) => Err(OmnidexError::Build(
            "extractor mixed local and global descriptors".to_string(),
        )),
    }
}

/// Build a table's primary index from freshly stored rows.
fn build_index(
    dir: &Path,
    meta: &TableMeta,
    stored: &[(Rid, Vec<String>)],
) -> OmnidexResult<TableIndex> {
    match meta.index.kind {
        IndexKind::Sequential => {
            let mut entries = keyed_entries(meta, stored)?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut index = SequentialIndex::create(
                dir,
                entry_codec(meta)?,
                SequentialConfig::default(),
                meta.index.unique,
            )?;
            index.bulk_load(&entries)?;
            Ok(TableIndex::Keyed(Box::new(index)))
        }
        IndexKind::Isam => {
            let mut entries = keyed_entries(meta, stored)?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let index = IsamIndex::build(
                dir,
                entry_codec(meta)?,
                IsamConfig::default(),
                meta.index.unique,
                &entries,
            )?;
            Ok(TableIndex::Keyed(Box::new(index)))
        }
        IndexKind::Hash => {
            let mut index = ExtendibleHashIndex::create(
                dir,
                entry_codec(meta)?,
                HashConfig {
                    unique: meta.index.unique,
                    ..HashConfig::default()
                },
            )?;
            for (key, rid) in keyed_entries(meta, stored)? {
                index.insert(key, rid)?;
            }
            Ok(TableIndex::Keyed(Box::new(index)))
        }
        IndexKind::BTree => {
            let mut index = BPlusTreeIndex::create(dir, BTreeConfig::default(), meta.index.unique);
            for (key, rid) in keyed_entries(meta, stored)? {
                index.insert(key, rid)?;
            }
            KeyIndex::persist(&index)?;
            Ok(TableIndex::Keyed(Box::new(index)))
        }
        IndexKind::RTree => {
            let metric = if meta.index.geographic {
                Metric::Haversine
            } else {
                Metric::Euclidean
            };
            let mut index = RTreeIndex::create(dir, RTreeConfig::default(), metric);
            for (rid, fields) in stored {
                index.insert_point(point_of_row(meta, fields)?, *rid);
            }
            index.persist()?;
            Ok(TableIndex::Spatial(index))
        }
        IndexKind::Spimi => {
            let docs: Vec<(Rid, Vec<String>)> = stored
                .iter()
                .map(|(rid, fields)| Ok((*rid, text_field_values(meta, fields)?)))
                .collect::<OmnidexResult<_>>()?;
            let index = TextIndex::build(
                dir,
                SpimiConfig {
                    language: meta.language.unwrap_or_default(),
                    ..SpimiConfig::default()
                },
                meta.index.fields.clone(),
                docs,
            )?;
            Ok(TableIndex::Text(index))
        }
        IndexKind::Media => Err(OmnidexError::Internal(
            "media index is built by create_multimedia_table".to_string(),
        )),
    }
}

fn keyed_entries(
    meta: &TableMeta,
    stored: &[(Rid, Vec<String>)],
) -> OmnidexResult<Vec<(Key, Rid)>> {
    stored
        .iter()
        .map(|(rid, fields)| Ok((key_of_row(meta, fields)?, *rid)))
        .collect()
}
