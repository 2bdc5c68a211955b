//! Composed fields: a parent-form field whose value is produced by an entire
//! nested form, with the nested form's fields described by a schema fetched
//! asynchronously and refetched as the nested values change.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::{BoxFuture, FutureExt};

use super::controller::{
    ChangeCommit, FieldId, FieldKey, FieldOptions, FormController, FormError, FormEvent,
    FormEventKind, FormId, FormOptions, FormResult, read_lock, unknown_field, write_lock,
};
use super::guard::{EffectGuard, GuardScope};
use super::handle::FormHandle;
use super::submission::SubmitPayload;
use super::validation::{ValidationTrigger, panic_message};
use super::value::{FieldError, FieldValue, ValueMap};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RefreshPolicy {
    #[default]
    Refetch,
    NoRefresh,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaEntry {
    pub name: FieldKey,
    pub value: FieldValue,
    pub label: Option<String>,
    pub required: bool,
    pub refresh: RefreshPolicy,
}

impl SchemaEntry {
    pub fn new(name: impl Into<FieldKey>, value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            label: None,
            required: true,
            refresh: RefreshPolicy::Refetch,
        }
    }

    pub fn label(mut self, value: impl Into<String>) -> Self {
        self.label = Some(value.into());
        self
    }

    pub fn required(mut self, value: bool) -> Self {
        self.required = value;
        self
    }

    pub fn refresh(mut self, value: RefreshPolicy) -> Self {
        self.refresh = value;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SchemaFetchError {
    #[error("schema request failed: {0}")]
    Request(String),
    #[error("schema provider panicked: {0}")]
    Panicked(String),
}

pub type SchemaFuture = BoxFuture<'static, Result<Vec<SchemaEntry>, SchemaFetchError>>;

pub trait SchemaProvider: Send + Sync + 'static {
    fn fetch(&self, seed: ValueMap) -> SchemaFuture;
}

impl<F, Fut> SchemaProvider for F
where
    F: Fn(ValueMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<SchemaEntry>, SchemaFetchError>> + Send + 'static,
{
    fn fetch(&self, seed: ValueMap) -> SchemaFuture {
        Box::pin((self)(seed))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchemaOutcome {
    Applied,
    Resubmitted,
    /// Superseded by a newer fetch or submission, or torn down.
    Stale,
    Failed,
}

struct ComposedInner {
    controller: FormController,
    parent: FieldId,
    nested: FormHandle,
    provider: Arc<dyn SchemaProvider>,
    fetch_scope: GuardScope,
    schema: RwLock<Vec<SchemaEntry>>,
    loading: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct ComposedField {
    inner: Arc<ComposedInner>,
}

impl ComposedField {
    /// Registers `name` in `parent_form`, marked `not ready yet`, and mounts
    /// a fresh nested form whose submissions are propagated to it. Call
    /// [`ComposedField::start`] to fetch the first schema.
    pub fn mount(
        controller: &FormController,
        parent_form: &FormId,
        name: impl Into<FieldKey>,
        initial_value: ValueMap,
        provider: impl SchemaProvider,
    ) -> FormResult<Self> {
        let parent = FieldId::new(parent_form.clone(), name.into());
        controller.register_field(
            parent_form,
            parent.name.clone(),
            FieldValue::Map(initial_value.clone()),
        )?;
        controller.set_field_error(parent_form, &parent.name, Some(FieldError::not_ready()))?;

        let nested = controller.mount_form(
            &FormId::next(),
            FormOptions {
                initial_values: initial_value,
                ..FormOptions::default()
            },
        )?;
        let loading = Arc::new(AtomicBool::new(true));
        nested.set_submit_handler(bridge(controller.clone(), parent.clone(), loading.clone()))?;
        tracing::debug!(field = %parent, nested = %nested.id(), "composed field mounted");

        Ok(Self {
            inner: Arc::new(ComposedInner {
                controller: controller.clone(),
                parent,
                nested,
                provider: Arc::new(provider),
                fetch_scope: GuardScope::new(),
                schema: RwLock::new(Vec::new()),
                loading,
            }),
        })
    }

    pub fn parent(&self) -> &FieldId {
        &self.inner.parent
    }

    pub fn nested(&self) -> &FormHandle {
        &self.inner.nested
    }

    pub fn nested_form_id(&self) -> &FormId {
        self.inner.nested.id()
    }

    pub fn schema(&self) -> FormResult<Vec<SchemaEntry>> {
        Ok(read_lock(&self.inner.schema, "reading composed schema")?.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> FormResult<SchemaOutcome> {
        let inner = &self.inner;
        let seed = inner
            .controller
            .field_meta(&inner.parent.form, inner.parent.name.as_str())?
            .and_then(|meta| meta.value.into_map())
            .unwrap_or_default();
        self.fetch(seed).await
    }

    pub async fn fetch(&self, seed: ValueMap) -> FormResult<SchemaOutcome> {
        let inner = &self.inner;
        let guard = inner.fetch_scope.begin();
        inner.loading.store(true, Ordering::SeqCst);
        self.propagate_error(FieldError::not_ready())?;

        let provider = inner.provider.clone();
        let result = AssertUnwindSafe(async move { provider.fetch(seed).await })
            .catch_unwind()
            .await;
        if let Err(stale) = guard.check_validity() {
            tracing::trace!(field = %inner.parent, %stale, "discarding stale schema");
            return Ok(SchemaOutcome::Stale);
        }
        let schema = match result {
            Ok(Ok(schema)) => schema,
            Ok(Err(error)) => return self.fetch_failed(&error),
            Err(panic) => {
                return self.fetch_failed(&SchemaFetchError::Panicked(panic_message(&*panic)));
            }
        };

        if !self.apply_schema(&guard, schema)? || !self.propagate().await? {
            return Ok(SchemaOutcome::Stale);
        }
        Ok(SchemaOutcome::Applied)
    }

    pub async fn on_child_change(
        &self,
        child: impl Into<FieldKey>,
        value: impl Into<FieldValue>,
    ) -> FormResult<SchemaOutcome> {
        let inner = &self.inner;
        let id = FieldId::new(inner.nested.id().clone(), child.into());
        if !inner.controller.has_field(&id.form, id.name.as_str())? {
            return Err(unknown_field(&id));
        }
        inner.nested.on_change(&id.name, value)?;

        let refresh = read_lock(&inner.schema, "reading composed schema")?
            .iter()
            .find(|entry| entry.name == id.name)
            .map(|entry| entry.refresh)
            .unwrap_or_default();
        match refresh {
            RefreshPolicy::NoRefresh => self.resubmit().await,
            RefreshPolicy::Refetch => {
                let seed = inner.nested.snapshot()?.values;
                self.fetch(seed).await
            }
        }
    }

    pub async fn resubmit(&self) -> FormResult<SchemaOutcome> {
        if self.propagate().await? {
            Ok(SchemaOutcome::Resubmitted)
        } else {
            Ok(SchemaOutcome::Stale)
        }
    }

    /// Submits the nested form; `false` when a newer submission superseded
    /// this one and its values never reached the parent.
    async fn propagate(&self) -> FormResult<bool> {
        let nested = &self.inner.nested;
        let handle = nested.submit()?;
        let ticket = handle.ticket();
        handle.await?;
        self.inner
            .controller
            .is_latest_submission(nested.id(), ticket)
    }

    pub fn teardown(&self) -> FormResult<()> {
        let inner = &self.inner;
        inner.fetch_scope.teardown();
        inner.controller.destroy_form(inner.nested.id())?;
        inner
            .controller
            .deregister_field(&inner.parent.form, &inner.parent.name)?;
        tracing::debug!(field = %inner.parent, "composed field torn down");
        Ok(())
    }

    fn propagate_error(&self, error: FieldError) -> FormResult<()> {
        let parent = &self.inner.parent;
        self.inner
            .controller
            .set_field_error(&parent.form, &parent.name, Some(error))
    }

    fn fetch_failed(&self, error: &SchemaFetchError) -> FormResult<SchemaOutcome> {
        tracing::warn!(field = %self.inner.parent, %error, "schema fetch failed");
        self.propagate_error(FieldError::fetch_failed())?;
        Ok(SchemaOutcome::Failed)
    }

    fn apply_schema(&self, guard: &EffectGuard, schema: Vec<SchemaEntry>) -> FormResult<bool> {
        let inner = &self.inner;
        let controller = &inner.controller;
        let nested = inner.nested.id();
        let mut events = Vec::new();
        let mut started = Vec::new();
        {
            let mut state = write_lock(&controller.state, "applying composed schema")?;
            if let Err(stale) = guard.check_validity() {
                tracing::trace!(field = %inner.parent, %stale, "discarding stale schema");
                return Ok(false);
            }

            let wanted = schema
                .iter()
                .map(|entry| &entry.name)
                .collect::<BTreeSet<_>>();
            let current = state
                .forms
                .get(nested)
                .map(|form| form.field_ids.clone())
                .unwrap_or_default();
            for name in current.into_iter().filter(|name| !wanted.contains(name)) {
                let id = FieldId::new(nested.clone(), name);
                if state.deregister(&id).is_some() {
                    events.push(FormEvent::field(&id, FormEventKind::FieldDeregistered));
                }
            }

            for entry in &schema {
                let id = FieldId::new(nested.clone(), entry.name.clone());
                if state.fields.get(&id).is_none() {
                    let mut options = FieldOptions::new(entry.name.clone(), entry.value.clone())
                        .required(entry.required);
                    options.label = entry.label.clone();
                    state.register(nested, options)?;
                    events.push(FormEvent::field(&id, FormEventKind::FieldRegistered));
                }
                state.fields.update(&id, |record| {
                    record.value = entry.value.clone();
                    record.required = entry.required;
                    record.label = entry.label.clone();
                });
                events.push(FormEvent::field(&id, FormEventKind::ValueChanged));
                let handle =
                    controller.start_validation_locked(&mut state, &id, ValidationTrigger::Revalidate);
                started.push((id, handle));
            }
            inner.loading.store(false, Ordering::SeqCst);
        }
        for (id, handle) in started {
            events.extend(controller.validation_events(&id, handle));
        }
        controller.emit(events);

        tracing::debug!(
            field = %inner.parent,
            fields = schema.len(),
            "composed schema applied"
        );
        *write_lock(&inner.schema, "storing composed schema")? = schema;
        Ok(true)
    }
}

fn bridge(
    controller: FormController,
    parent: FieldId,
    loading: Arc<AtomicBool>,
) -> impl Fn(SubmitPayload, FormHandle) -> BoxFuture<'static, FormResult<()>> + Send + Sync + 'static
{
    move |payload: SubmitPayload, _nested: FormHandle| {
        let controller = controller.clone();
        let parent = parent.clone();
        let loading = loading.clone();
        async move {
            let error = if payload.has_errors() {
                Some(FieldError::missing_fields(payload.validation.keys()))
            } else if loading.load(Ordering::SeqCst) {
                Some(FieldError::not_ready())
            } else {
                None
            };
            let (nested, ticket) = (payload.form_id, payload.ticket);
            let commit = controller.change_with_error_if(
                &parent,
                FieldValue::Map(payload.values),
                error,
                |state| state.is_latest_submission(&nested, ticket),
            )?;
            match commit {
                ChangeCommit::Committed(Some(handle)) => {
                    handle.await;
                }
                ChangeCommit::Committed(None) => {}
                ChangeCommit::Discarded => {
                    tracing::trace!(
                        field = %parent,
                        ticket = ticket.0,
                        "discarding superseded nested submission"
                    );
                }
            }
            Ok::<(), FormError>(())
        }
        .boxed()
    }
}
