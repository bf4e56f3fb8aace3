//! Connection: compiled-plan cache, strategy dispatch and cursor creation.

pub mod config;

pub use config::{ConfigError, ConnectionConfig, DEFAULT_PORT};

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::{Dispatcher, ExecutionContext, ExecutionMode, ExecutionStrategy, RawResult};
use crate::query::subquery::detect_from_subquery;
use crate::query::{CacheStats, Compiler, ExecutionPlan, FunctionRegistry, Parameters, PlanCache};
use crate::result::ResultCursor;
use crate::storage::{DocumentStore, Session};

/// A SQL connection over one document store
pub struct Connection {
    store: Arc<dyn DocumentStore>,
    config: ConnectionConfig,
    compiler: Arc<Compiler>,
    cache: PlanCache,
    dispatcher: Dispatcher,
    session: Option<Session>,
}

impl Connection {
    pub fn new(store: Arc<dyn DocumentStore>, config: ConnectionConfig) -> Self {
        Self::with_registry(store, config, Arc::new(FunctionRegistry::default()))
    }

    /// Connection whose compiler uses a custom function registry
    pub fn with_registry(
        store: Arc<dyn DocumentStore>,
        config: ConnectionConfig,
        registry: Arc<FunctionRegistry>,
    ) -> Self {
        let compiler = Arc::new(Compiler::new(registry).strict(config.strict_translation));
        let cache = PlanCache::with_config(config.plan_cache_size, config.plan_cache_ttl());
        let dispatcher = Dispatcher::with_defaults(Arc::clone(&compiler));
        tracing::debug!(
            address = %config.address(),
            mode = config.mode.as_str(),
            strategies = ?dispatcher.strategy_names(),
            "connection created"
        );
        Self {
            store,
            config,
            compiler,
            cache,
            dispatcher,
            session: None,
        }
    }

    /// Attach a session; every command issued afterwards carries it
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Append a strategy after the defaults
    pub fn register_strategy(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.dispatcher.register(strategy);
    }

    /// Compile through the plan cache
    pub fn compile(&self, sql: &str) -> Result<Arc<ExecutionPlan>> {
        self.cache
            .get_or_compile(sql, |sql| self.compiler.compile(sql))
            .map_err(Error::from)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Unbound cursor using this connection's arraysize
    pub fn cursor(&self) -> ResultCursor {
        ResultCursor::new().with_arraysize(self.config.arraysize)
    }

    /// Plan for `sql`. In two-stage mode an outer statement the document
    /// compiler rejects still runs when it wraps a FROM subquery, since only
    /// the inner statement executes natively.
    fn plan_for(&self, sql: &str) -> Result<Arc<ExecutionPlan>> {
        match self.compile(sql) {
            Ok(plan) => Ok(plan),
            Err(e) if self.config.mode == ExecutionMode::TwoStage => match detect_from_subquery(sql) {
                Some(wrapped) => {
                    tracing::debug!(error = %e, "outer statement left to the relational engine");
                    self.compile(&wrapped.inner)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn run(&self, sql: &str, plan: &ExecutionPlan, params: &Parameters) -> Result<RawResult> {
        let ctx = ExecutionContext::new(sql, self.config.mode)
            .with_session(self.session.as_ref())
            .with_batch_size(self.config.batch_size);
        let strategy = self.dispatcher.select(&ctx);
        tracing::debug!(strategy = strategy.name(), kind = plan.kind(), "executing statement");
        strategy.execute(&ctx, plan, &self.store, params)
    }

    /// Execute one statement and return a cursor over its result
    pub fn execute(&self, sql: &str, params: &Parameters) -> Result<ResultCursor> {
        let plan = self.plan_for(sql)?;
        let raw = self.run(sql, &plan, params)?;
        let mut cursor = self.cursor();
        cursor.bind(raw, Arc::clone(&self.store))?;
        Ok(cursor)
    }

    /// Execute a write once per parameter set; returns the total affected count
    pub fn execute_many(&self, sql: &str, param_sets: &[Parameters]) -> Result<u64> {
        let plan = self.compile(sql)?;
        if matches!(*plan, ExecutionPlan::Query(_)) {
            return Err(Error::Programming(
                "execute_many only accepts INSERT, UPDATE or DELETE".to_string(),
            ));
        }

        let mut total = 0;
        for params in param_sets {
            match self.run(sql, &plan, params)? {
                RawResult::Write { affected, .. } => total += affected,
                RawResult::Cursor { .. } => {
                    return Err(Error::Programming(
                        "write statement produced a result set".to_string(),
                    ))
                }
            }
        }
        Ok(total)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
