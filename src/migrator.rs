//! Migration controller.
//!
//! Rows are processed one at a time: map, build into the shared graph, apply
//! defaults and cascades, uniquify, validate, then persist. Changes a row makes
//! to the working set are journaled and rolled back unless every stage
//! succeeds, so a rejected row leaves no trace in the graph or the ancestor
//! cache.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};

use crate::{
    builder::{GraphBuilder, cascade},
    cache::AncestorCache,
    coerce::Coercer,
    config::SchemaProvider,
    defaults::{Resolver, Uniquifier, validate},
    error::{MappingError, MigrationError, RowError},
    graph::{Graph, NodeId},
    hooks::HookRegistry,
    io_utils,
    mapping::{AssignmentTree, MappingPlan},
    model::TypeRegistry,
    persist::{PersistedIds, PersistenceDriver, PersistenceGateway},
    rows::{Row, RowContext, SourceError},
};

/// Nodes a working set may gain beyond twice its last compacted size before
/// it is compacted again.
const COMPACT_SLACK: usize = 256;

/// The graph and cache shared by the rows of one scope.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    pub graph: Graph,
    pub cache: AncestorCache,
    retained: usize,
}

impl WorkingSet {
    /// Starts a row; everything until `commit` or `rollback` is journaled.
    fn begin(&mut self) {
        self.graph.begin();
        self.cache.begin();
    }

    fn commit(&mut self) {
        self.graph.commit();
        self.cache.commit();
    }

    fn rollback(&mut self) {
        self.graph.rollback();
        self.cache.rollback();
    }

    fn evict(&mut self) {
        self.graph.clear();
        self.cache.clear();
        self.retained = 0;
    }

    /// Keeps only what cached ancestors can still reach, once the graph has
    /// doubled since the last compaction.
    fn compact(&mut self) {
        if self.graph.len() < self.retained * 2 + COMPACT_SLACK {
            return;
        }
        self.force_compact();
    }

    fn force_compact(&mut self) {
        let roots: Vec<NodeId> = self.cache.nodes().collect();
        let keep: BTreeSet<NodeId> = self.graph.reachable(&roots).into_iter().collect();
        self.graph.retain(&keep);
        self.retained = self.graph.len();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    pub dry_run: bool,
    pub unique: bool,
    /// Stop after this many input rows.
    pub limit: Option<usize>,
    /// Checked between rows only.
    pub stop: Option<Arc<AtomicBool>>,
}

impl MigrationOptions {
    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// A row diverted to the rejects sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub row: usize,
    pub fields: Vec<String>,
    pub kind: &'static str,
    pub reason: String,
}

pub trait RejectSink {
    fn reject(&mut self, rejection: &Rejection) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One delimited line per rejected row: the raw fields followed by the reason.
pub struct CsvRejectSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvRejectSink<W> {
    pub fn new(writer: W, delimiter: u8) -> Self {
        Self {
            writer: io_utils::open_rejects_writer(writer, delimiter),
        }
    }
}

impl<W: Write> RejectSink for CsvRejectSink<W> {
    fn reject(&mut self, rejection: &Rejection) -> io::Result<()> {
        let mut record = rejection.fields.clone();
        record.push(rejection.reason.clone());
        self.writer.write_record(&record)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardRejects;

impl RejectSink for DiscardRejects {
    fn reject(&mut self, _rejection: &Rejection) -> io::Result<()> {
        Ok(())
    }
}

impl RejectSink for Vec<Rejection> {
    fn reject(&mut self, rejection: &Rejection) -> io::Result<()> {
        self.push(rejection.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub total: usize,
    pub succeeded: usize,
    pub rejected: usize,
    pub warnings: usize,
    pub evictions: usize,
    pub created: usize,
    pub updated: usize,
    pub fetched: usize,
    pub stopped: bool,
}

impl MigrationReport {
    /// `(label, value)` pairs for the run summary table.
    pub fn summary_rows(&self) -> Vec<Vec<String>> {
        [
            ("rows", self.total),
            ("succeeded", self.succeeded),
            ("rejected", self.rejected),
            ("warnings", self.warnings),
            ("scope evictions", self.evictions),
            ("objects created", self.created),
            ("objects updated", self.updated),
            ("objects reused", self.fetched),
        ]
        .into_iter()
        .map(|(label, value)| vec![label.to_string(), value.to_string()])
        .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowOutcome {
    pub entries: BTreeMap<String, NodeId>,
    pub warnings: Vec<String>,
    pub persisted: PersistedIds,
}

/// Everything a migration run needs, passed explicitly rather than held in
/// globals.
pub struct MigrationContext<G: PersistenceGateway> {
    registry: Box<dyn TypeRegistry>,
    gateway: G,
    plan: MappingPlan,
    resolver: Resolver,
    coercer: Coercer,
    hooks: HookRegistry,
    working: WorkingSet,
    uniquifier: Uniquifier,
    scope: Option<String>,
    headers: Vec<String>,
}

impl<G: PersistenceGateway> MigrationContext<G> {
    pub fn new<T>(
        registry: T,
        provider: &dyn SchemaProvider,
        headers: Vec<String>,
        gateway: G,
    ) -> Result<Self, MappingError>
    where
        T: TypeRegistry + 'static,
    {
        Self::with_parts(
            registry,
            provider,
            headers,
            gateway,
            Coercer::default(),
            HookRegistry::new(),
        )
    }

    /// Builds a context with custom conversion and migration hooks.
    pub fn with_parts<T>(
        registry: T,
        provider: &dyn SchemaProvider,
        headers: Vec<String>,
        gateway: G,
        coercer: Coercer,
        hooks: HookRegistry,
    ) -> Result<Self, MappingError>
    where
        T: TypeRegistry + 'static,
    {
        let (plan, resolver) = provider.compile(&headers, &registry, &coercer)?;
        debug!(
            "Compiled {} column mapping(s) and {} default rule(s) for root {}",
            plan.columns.len(),
            resolver.rule_count(),
            plan.root_class()
        );
        Ok(Self {
            registry: Box::new(registry),
            gateway,
            plan,
            resolver,
            coercer,
            hooks,
            working: WorkingSet::default(),
            uniquifier: Uniquifier::new(),
            scope: None,
            headers,
        })
    }

    pub fn with_uniquifier(mut self, uniquifier: Uniquifier) -> Self {
        self.uniquifier = uniquifier;
        self
    }

    /// For default rules computed in code.
    pub fn resolver_mut(&mut self) -> &mut Resolver {
        &mut self.resolver
    }

    pub fn plan(&self) -> &MappingPlan {
        &self.plan
    }

    pub fn graph(&self) -> &Graph {
        &self.working.graph
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn into_gateway(self) -> G {
        self.gateway
    }

    pub fn run<I, S>(
        &mut self,
        rows: I,
        options: &MigrationOptions,
        rejects: &mut S,
    ) -> Result<MigrationReport, MigrationError>
    where
        I: IntoIterator<Item = Result<Row, SourceError>>,
        S: RejectSink + ?Sized,
    {
        let mut report = MigrationReport::default();
        let mut rows = rows.into_iter();
        loop {
            if options.stop_requested() {
                info!("Stop requested; ending after {} row(s)", report.total);
                report.stopped = true;
                break;
            }
            if options.limit.is_some_and(|limit| report.total >= limit) {
                break;
            }
            let Some(item) = rows.next() else {
                break;
            };
            report.total += 1;
            let row = match item {
                Ok(row) => row,
                Err(SourceError::Malformed {
                    number,
                    fields,
                    message,
                }) => {
                    let rejection = rejection(number, fields, &RowError::Malformed(message));
                    record_rejection(&mut report, rejects, &rejection)?;
                    continue;
                }
                Err(SourceError::Fatal(err)) => return Err(err.into()),
            };

            if self.enter_scope(&row) {
                report.evictions += 1;
            }
            match self.migrate_row(&row, options) {
                Ok(outcome) => {
                    report.succeeded += 1;
                    report.warnings += outcome.warnings.len();
                    report.created += outcome.persisted.created;
                    report.updated += outcome.persisted.updated;
                    report.fetched += outcome.persisted.fetched;
                }
                Err(err) => {
                    let rejection = rejection(row.number, row.fields, &err);
                    record_rejection(&mut report, rejects, &rejection)?;
                }
            }
        }
        rejects.flush()?;
        info!(
            "Migrated {} of {} row(s); {} rejected, {} warning(s)",
            report.succeeded, report.total, report.rejected, report.warnings
        );
        Ok(report)
    }

    /// Evicts the working set when the scope column changes value. Returns
    /// whether anything was evicted.
    fn enter_scope(&mut self, row: &Row) -> bool {
        let Some(value) = self.plan.scope_value(row) else {
            return false;
        };
        if self.scope.as_deref() == Some(value) {
            return false;
        }
        let evicted = self.scope.is_some();
        if evicted {
            info!(
                "Scope changed to '{value}'; evicting {} cached ancestor(s)",
                self.working.cache.len()
            );
            self.working.evict();
        }
        self.scope = Some(value.to_string());
        evicted
    }

    /// Runs one row through every stage and commits its graph on success.
    pub fn migrate_row(
        &mut self,
        row: &Row,
        options: &MigrationOptions,
    ) -> Result<RowOutcome, RowError> {
        let ctx = RowContext::new(row, &self.headers);
        let mapped = self.plan.map(row, &self.coercer, &ctx)?;
        for warning in &mapped.warnings {
            warn!("Row {}: {warning}", row.number);
        }
        if mapped.tree.is_empty() {
            return Err(RowError::Malformed("no mapped column has a value".to_string()));
        }

        let stages = Stages {
            registry: self.registry.as_ref(),
            hooks: &self.hooks,
            resolver: &self.resolver,
            uniquifier: &self.uniquifier,
        };
        self.working.begin();
        match stages.run(&mut self.working, &mut self.gateway, &mapped.tree, &ctx, options) {
            Ok((entries, persisted)) => {
                self.working.commit();
                self.working.compact();
                Ok(RowOutcome {
                    entries,
                    warnings: mapped.warnings,
                    persisted,
                })
            }
            Err(err) => {
                self.working.rollback();
                Err(err)
            }
        }
    }
}

/// The per-row stages after mapping, borrowed from the context.
struct Stages<'a> {
    registry: &'a dyn TypeRegistry,
    hooks: &'a HookRegistry,
    resolver: &'a Resolver,
    uniquifier: &'a Uniquifier,
}

impl Stages<'_> {
    fn run<G>(
        &self,
        working: &mut WorkingSet,
        gateway: &mut G,
        tree: &AssignmentTree,
        ctx: &RowContext<'_>,
        options: &MigrationOptions,
    ) -> Result<(BTreeMap<String, NodeId>, PersistedIds), RowError>
    where
        G: PersistenceGateway + ?Sized,
    {
        let built = GraphBuilder::new(self.registry, self.hooks).apply(
            tree,
            &mut working.graph,
            &mut working.cache,
            ctx,
        )?;
        let roots: Vec<NodeId> = built.entries.values().copied().collect();

        let defaults = self
            .resolver
            .apply_defaults(self.registry, &mut working.graph, &roots)?;
        let cascaded = cascade(self.registry, &mut working.graph, &roots);
        let uniquified = if options.unique {
            self.resolver
                .uniquify(&mut working.graph, &roots, self.uniquifier)
        } else {
            0
        };
        debug!(
            "Row {}: {} default(s), {} cascaded value(s), {} uniquified key(s)",
            ctx.row.number, defaults.filled, cascaded, uniquified
        );
        validate(self.registry, &working.graph, self.hooks, &roots)?;

        let persisted = if options.dry_run {
            PersistedIds::default()
        } else {
            PersistenceDriver::new(self.registry).persist(&mut working.graph, gateway, &roots)?
        };
        Ok((built.entries, persisted))
    }
}

fn rejection(row: usize, fields: Vec<String>, err: &RowError) -> Rejection {
    Rejection {
        row,
        fields,
        kind: err.kind(),
        reason: err.to_string(),
    }
}

fn record_rejection<S>(
    report: &mut MigrationReport,
    rejects: &mut S,
    rejection: &Rejection,
) -> Result<(), MigrationError>
where
    S: RejectSink + ?Sized,
{
    warn!(
        "Row {} rejected ({}): {}",
        rejection.row, rejection.kind, rejection.reason
    );
    report.rejected += 1;
    rejects.reject(rejection)?;
    Ok(())
}
