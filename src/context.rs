//! Process-scoped state shared by all crypto sessions.
//!
//! A [`CryptoContext`] owns the engine handle and everything that would
//! otherwise be global: the engine initialization flag and session counter,
//! the engine lock, the per-security-level usage table headers and the
//! request id counter. Independent contexts never share state, so tests can
//! run several "processes" side by side.
//!
//! Lock order: static fields, then engine lock, then a session's own lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::oemcrypto::{CdmSecurityLevel, OemCrypto};
use crate::properties::Properties;
use crate::usage_table::{MemoryUsageTableStore, UsageTableHeader, UsageTableStore};

#[derive(Debug, Default)]
struct StaticFields {
    initialized: bool,
    session_count: usize,
}

enum HeaderSlot {
    Empty,
    Initializing,
    Ready(Arc<UsageTableHeader>),
}

/// Shared engine context; construct once and hand an `Arc` to every session.
pub struct CryptoContext {
    engine: Arc<dyn OemCrypto>,
    properties: Properties,
    usage_table_store: Arc<dyn UsageTableStore>,
    static_fields: RwLock<StaticFields>,
    engine_lock: RwLock<()>,
    // L1 and L3 headers.
    usage_table_headers: Mutex<[HeaderSlot; 2]>,
    usage_table_ready: Condvar,
    request_id_index: AtomicU64,
}

impl CryptoContext {
    /// Create a context with an in-memory usage table store.
    pub fn new(engine: Arc<dyn OemCrypto>, properties: Properties) -> Arc<Self> {
        Self::with_usage_table_store(engine, properties, Arc::new(MemoryUsageTableStore::default()))
    }

    pub fn with_usage_table_store(
        engine: Arc<dyn OemCrypto>,
        properties: Properties,
        usage_table_store: Arc<dyn UsageTableStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            properties,
            usage_table_store,
            static_fields: RwLock::new(StaticFields::default()),
            engine_lock: RwLock::new(()),
            usage_table_headers: Mutex::new([HeaderSlot::Empty, HeaderSlot::Empty]),
            usage_table_ready: Condvar::new(),
            request_id_index: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn OemCrypto> {
        &self.engine
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub fn usage_table_store(&self) -> &Arc<dyn UsageTableStore> {
        &self.usage_table_store
    }

    /// Whether the engine has been globally initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.static_fields.read().initialized
    }

    /// Number of live sessions registered with this context.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.static_fields.read().session_count
    }

    /// Register a session, initializing the engine on the first one.
    pub(crate) fn register_session(&self) {
        let mut fields = self.static_fields.write();
        fields.session_count += 1;
        if fields.initialized {
            return;
        }

        if let Some(sandbox_id) = &self.properties.sandbox_id {
            let result = self.with_engine_write_lock("OEMCrypto_SetSandbox", |engine| {
                engine.set_sandbox(sandbox_id.as_bytes())
            });
            if let Err(err) = result {
                warn!("OEMCrypto_SetSandbox failed: {}", err);
            }
        }

        match self.with_engine_write_lock("OEMCrypto_Initialize", |engine| engine.initialize()) {
            Ok(()) => {
                info!("OEMCrypto initialized");
                fields.initialized = true;
            }
            Err(err) => error!("OEMCrypto_Initialize failed: {} ({})", err, err.code()),
        }
    }

    /// Unregister a session, tearing the engine down after the last one.
    pub(crate) fn unregister_session(&self) {
        let mut fields = self.static_fields.write();
        if fields.session_count > 0 {
            fields.session_count -= 1;
        } else {
            error!("CryptoContext: session count already zero");
        }
        if fields.session_count > 0 || !fields.initialized {
            return;
        }

        if let Err(err) = self.with_engine_write_lock("OEMCrypto_Terminate", |engine| engine.terminate()) {
            error!("OEMCrypto_Terminate failed: {} ({})", err, err.code());
        }
        let mut headers = self.usage_table_headers.lock();
        *headers = [HeaderSlot::Empty, HeaderSlot::Empty];
        fields.initialized = false;
        info!("OEMCrypto terminated");
    }

    pub(crate) fn next_request_index(&self) -> u64 {
        self.request_id_index.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn with_engine_read_lock<R>(&self, tag: &str, f: impl FnOnce(&dyn OemCrypto) -> R) -> R {
        trace!("OEMCrypto read lock - {}", tag);
        let _guard = self.engine_lock.read();
        f(self.engine.as_ref())
    }

    pub(crate) fn with_engine_write_lock<R>(&self, tag: &str, f: impl FnOnce(&dyn OemCrypto) -> R) -> R {
        trace!("OEMCrypto write lock - {}", tag);
        let _guard = self.engine_lock.write();
        f(self.engine.as_ref())
    }

    /// Currently installed usage table header for `level`, if any.
    #[must_use]
    pub fn usage_table_header(&self, level: CdmSecurityLevel) -> Option<Arc<UsageTableHeader>> {
        let index = header_slot(level)?;
        match &self.usage_table_headers.lock()[index] {
            HeaderSlot::Ready(header) => Some(Arc::clone(header)),
            _ => None,
        }
    }

    /// Return the usage table header for `level`, running `init` to create
    /// it if none exists yet.
    ///
    /// Only one caller runs `init` at a time; others wait for its result. If
    /// it fails, the next waiter gets to try.
    pub(crate) fn usage_table_header_or_init<F>(&self, level: CdmSecurityLevel, init: F) -> Option<Arc<UsageTableHeader>>
    where
        F: FnOnce() -> Option<Arc<UsageTableHeader>>,
    {
        let index = header_slot(level)?;
        let mut slots = self.usage_table_headers.lock();
        loop {
            match &slots[index] {
                HeaderSlot::Ready(header) => return Some(Arc::clone(header)),
                HeaderSlot::Initializing => self.usage_table_ready.wait(&mut slots),
                HeaderSlot::Empty => break,
            }
        }
        slots[index] = HeaderSlot::Initializing;
        drop(slots);

        let header = init();

        let mut slots = self.usage_table_headers.lock();
        slots[index] = match &header {
            Some(header) => HeaderSlot::Ready(Arc::clone(header)),
            None => HeaderSlot::Empty,
        };
        drop(slots);
        self.usage_table_ready.notify_all();
        header
    }
}

fn header_slot(level: CdmSecurityLevel) -> Option<usize> {
    match level {
        CdmSecurityLevel::L1 => Some(0),
        CdmSecurityLevel::L3 => Some(1),
        _ => None,
    }
}
