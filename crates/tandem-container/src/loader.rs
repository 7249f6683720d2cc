//! Per-client container factory
//!
//! A [`Loader`] is the explicit context object a client constructs once and
//! threads through every open. It holds the ordering service, the snapshot
//! store, the type registry and configuration, and it refuses to open a
//! second container for a `(tenant, document)` scope that is still alive.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::{DocumentId, Result, TandemConfig, TandemError, TenantId};
use tandem_protocol::{ClientDescriptor, OrderingService};
use tandem_snapshot::SnapshotStore;
use tracing::info;

use crate::container::{Container, ContainerParts};
use crate::registry::Registry;

type ScopeKey = (TenantId, DocumentId);

/// Releases a `(tenant, document)` scope when the owning container drops
#[derive(Debug)]
pub(crate) struct ScopeGuard {
    key: ScopeKey,
    open: Arc<Mutex<HashSet<ScopeKey>>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.open.lock().remove(&self.key);
    }
}

/// Opens containers for one client
#[derive(Clone)]
pub struct Loader {
    service: Arc<dyn OrderingService>,
    store: SnapshotStore,
    registry: Arc<Registry>,
    config: TandemConfig,
    open: Arc<Mutex<HashSet<ScopeKey>>>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("registry", &self.registry)
            .field("open", &self.open.lock().len())
            .finish_non_exhaustive()
    }
}

impl Loader {
    /// Create a loader. The configuration is validated here.
    pub fn new(
        service: Arc<dyn OrderingService>,
        store: SnapshotStore,
        registry: Registry,
        config: TandemConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            service,
            store,
            registry: Arc::new(registry),
            config,
            open: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Type registry shared by every container this loader opens
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn claim(&self, tenant: &TenantId, document: &DocumentId) -> Result<ScopeGuard> {
        let key = (tenant.clone(), document.clone());
        let mut open = self.open.lock();
        if !open.insert(key.clone()) {
            return Err(TandemError::configuration(format!(
                "document {tenant}/{document} is already open in this loader"
            )));
        }
        Ok(ScopeGuard {
            key,
            open: self.open.clone(),
        })
    }

    fn parts(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
        descriptor: ClientDescriptor,
        scope: ScopeGuard,
    ) -> ContainerParts {
        ContainerParts {
            tenant_id: tenant.clone(),
            document_id: document.clone(),
            token: token.to_string(),
            descriptor,
            service: self.service.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            scope,
        }
    }

    /// Create a new document and open it. Root objects from the registry's
    /// eager-initialization list are created before this returns.
    pub async fn create_container(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
        descriptor: ClientDescriptor,
    ) -> Result<Container> {
        let scope = self.claim(tenant, document)?;
        self.service.create_document(tenant, document, token).await?;
        let connection = self
            .service
            .connect(tenant, document, token, descriptor.clone())
            .await?;

        if connection.session.existing {
            self.service.disconnect(&connection.session.client_id).await?;
            return Err(TandemError::invalid_state(format!(
                "document {tenant}/{document} was opened before it was created here"
            )));
        }

        let parts = self.parts(tenant, document, token, descriptor, scope);
        let container = Container::open(parts, connection, None).await?;
        container.create_root_objects()?;
        container.flush().await?;
        info!(
            tenant = %tenant,
            document = %document,
            roots = self.registry.root_objects().len(),
            "Container created"
        );
        Ok(container)
    }

    /// Open an existing document from its latest snapshot plus backlog.
    /// The eager-initialization list is not run.
    pub async fn load_container(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
        descriptor: ClientDescriptor,
    ) -> Result<Container> {
        let scope = self.claim(tenant, document)?;
        let connection = self
            .service
            .connect(tenant, document, token, descriptor.clone())
            .await?;
        // Created but never opened: there is no container to load yet
        if !connection.session.existing {
            self.service.disconnect(&connection.session.client_id).await?;
            return Err(TandemError::not_found(format!(
                "document {tenant}/{document} has never been opened"
            )));
        }
        let snapshot = self.store.read(tenant, document).await?;

        let parts = self.parts(tenant, document, token, descriptor, scope);
        let container = Container::open(parts, connection, snapshot).await?;
        info!(
            tenant = %tenant,
            document = %document,
            sequence_number = container.sequence_number(),
            parent_branch = ?container.parent_branch(),
            "Container loaded"
        );
        Ok(container)
    }
}
