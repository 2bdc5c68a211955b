use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::task::{Spawn, SpawnExt};

use super::handle::FormHandle;
use super::store::{FieldRecord, StoreState};
use super::validation::{FieldValidator, ValidationHandle, ValidationTrigger, ValidatorFn};
use super::value::{FieldError, FieldValue, ValueMap};

static FORM_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(Arc<str>);

impl FormId {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn next() -> Self {
        Self::new(format!(
            "form-{}",
            FORM_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FormId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FormId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldKey(Arc<str>);

impl FieldKey {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for FieldKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FieldKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FieldKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&FieldKey> for FieldKey {
    fn from(value: &FieldKey) -> Self {
        value.clone()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldId {
    pub form: FormId,
    pub name: FieldKey,
}

impl FieldId {
    pub fn new(form: FormId, name: FieldKey) -> Self {
        Self { form, name }
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.form, self.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValidationTriggers {
    pub on_mount: bool,
    pub on_change: bool,
    pub on_blur: bool,
}

impl Default for ValidationTriggers {
    fn default() -> Self {
        Self {
            on_mount: true,
            on_change: true,
            on_blur: true,
        }
    }
}

impl ValidationTriggers {
    pub const fn none() -> Self {
        Self {
            on_mount: false,
            on_change: false,
            on_blur: false,
        }
    }

    pub(super) fn fires_on(self, trigger: ValidationTrigger) -> bool {
        match trigger {
            ValidationTrigger::Mount => self.on_mount,
            ValidationTrigger::Change => self.on_change,
            ValidationTrigger::Blur => self.on_blur,
            ValidationTrigger::Revalidate | ValidationTrigger::Explicit => true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormOptions {
    pub triggers: ValidationTriggers,
    pub reset_on_unmount: bool,
    pub initial_values: ValueMap,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            triggers: ValidationTriggers::default(),
            reset_on_unmount: true,
            initial_values: ValueMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct FieldOptions {
    pub name: FieldKey,
    pub default_value: FieldValue,
    pub required: bool,
    pub label: Option<String>,
    pub debounce: Duration,
    pub(super) validator: Option<ValidatorFn>,
}

impl FieldOptions {
    pub fn new(name: impl Into<FieldKey>, default_value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            default_value: default_value.into(),
            required: false,
            label: None,
            debounce: Duration::ZERO,
            validator: None,
        }
    }

    pub fn required(mut self, value: bool) -> Self {
        self.required = value;
        self
    }

    pub fn label(mut self, value: impl Into<String>) -> Self {
        self.label = Some(value.into());
        self
    }

    pub fn debounce_ms(mut self, value: u64) -> Self {
        self.debounce = Duration::from_millis(value);
        self
    }

    pub fn validator(mut self, validator: impl FieldValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }
}

impl Debug for FieldOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldOptions")
            .field("name", &self.name)
            .field("default_value", &self.default_value)
            .field("required", &self.required)
            .field("label", &self.label)
            .field("debounce", &self.debounce)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldMeta {
    pub name: FieldKey,
    pub value: FieldValue,
    pub default_value: FieldValue,
    pub label: Option<String>,
    pub required: bool,
    pub touched: bool,
    pub dirty: bool,
    pub validating: bool,
    pub error: Option<FieldError>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormSnapshot {
    pub form_id: FormId,
    pub field_ids: Vec<FieldKey>,
    pub values: ValueMap,
    pub errors: BTreeMap<FieldKey, FieldError>,
    pub touched: BTreeMap<FieldKey, bool>,
    pub validating: BTreeSet<FieldKey>,
    pub fields: BTreeMap<FieldKey, FieldMeta>,
    pub is_submitting: bool,
    pub submit_count: u32,
}

impl FormSnapshot {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.validating.is_empty()
    }

    pub fn error(&self, name: &str) -> Option<&FieldError> {
        self.errors.get(name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormEventKind {
    FieldRegistered,
    FieldDeregistered,
    ValueChanged,
    Touched,
    ValidatorChanged,
    ValidationStarted,
    ValidationCommitted,
    SubmissionStarted,
    SubmissionFinished,
    Reset,
    FormDestroyed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormEvent {
    pub form_id: FormId,
    pub field: Option<FieldKey>,
    pub kind: FormEventKind,
}

impl FormEvent {
    pub(super) fn form(form_id: &FormId, kind: FormEventKind) -> Self {
        Self {
            form_id: form_id.clone(),
            field: None,
            kind,
        }
    }

    pub(super) fn field(id: &FieldId, kind: FormEventKind) -> Self {
        Self {
            form_id: id.form.clone(),
            field: Some(id.name.clone()),
            kind,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(pub u64);

type Listener = Arc<dyn Fn(&FormEvent) + Send + Sync>;

#[derive(Default)]
pub(super) struct Listeners {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, (FormId, Listener)>,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FormError {
    #[error("form state lock poisoned while {0}")]
    StatePoisoned(&'static str),
    #[error("field `{name}` is already registered in form `{form}`")]
    DuplicateField { form: FormId, name: FieldKey },
    #[error("field `{registered}` of form `{form}` cannot be renamed to `{requested}`")]
    FieldRenamed {
        form: FormId,
        registered: FieldKey,
        requested: FieldKey,
    },
    #[error("field `{name}` cannot move from form `{registered}` to form `{requested}`")]
    FormChanged {
        name: FieldKey,
        registered: FormId,
        requested: FormId,
    },
    #[error("form `{0}` is not known")]
    UnknownForm(FormId),
    #[error("field `{name}` is not registered in form `{form}`")]
    UnknownField { form: FormId, name: FieldKey },
    #[error("field `{field}` does not hold {expected}")]
    Decode {
        field: FieldKey,
        expected: &'static str,
    },
    #[error("submit handler failed: {0}")]
    SubmitRejected(String),
    #[error("form `{0}` has no spawner to run a detached submission")]
    NoSpawner(FormId),
    #[error("failed to spawn form task: {0}")]
    SpawnFailed(String),
}

pub(super) enum ChangeCommit {
    Committed(Option<ValidationHandle>),
    Discarded,
}

pub type FormResult<T> = Result<T, FormError>;

#[derive(Clone)]
pub struct FormController {
    pub(super) state: Arc<RwLock<StoreState>>,
    pub(super) listeners: Arc<RwLock<Listeners>>,
    spawner: Option<Arc<dyn Spawn + Send + Sync>>,
}

impl Default for FormController {
    fn default() -> Self {
        Self::new()
    }
}

impl FormController {
    /// Without a spawner nothing runs in the background: a validation or a
    /// submission only makes progress while someone awaits its handle, and
    /// [`FormController::handle_submit`] is refused.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            listeners: Arc::new(RwLock::new(Listeners::default())),
            spawner: None,
        }
    }

    pub fn with_spawner(mut self, spawner: impl Spawn + Send + Sync + 'static) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    pub fn form(&self, form_id: impl Into<FormId>) -> FormHandle {
        FormHandle::new(self.clone(), form_id.into())
    }

    pub fn ensure_form(&self, form_id: &FormId) -> FormResult<()> {
        write_lock(&self.state, "ensuring form record")?
            .forms
            .ensure(form_id);
        Ok(())
    }

    pub fn mount_form(&self, form_id: &FormId, options: FormOptions) -> FormResult<FormHandle> {
        {
            let mut state = write_lock(&self.state, "mounting form")?;
            state.forms.ensure(form_id).options = options;
        }
        tracing::debug!(form = %form_id, "form mounted");
        Ok(self.form(form_id.clone()))
    }

    pub fn form_options(&self, form_id: &FormId) -> FormResult<FormOptions> {
        read_lock(&self.state, "reading form options")?
            .forms
            .get(form_id)
            .map(|form| form.options.clone())
            .ok_or_else(|| FormError::UnknownForm(form_id.clone()))
    }

    pub fn has_form(&self, form_id: &FormId) -> FormResult<bool> {
        Ok(read_lock(&self.state, "checking form record")?
            .forms
            .get(form_id)
            .is_some())
    }

    pub fn register_field(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        default_value: impl Into<FieldValue>,
    ) -> FormResult<()> {
        self.register_field_with(form_id, FieldOptions::new(name, default_value))
    }

    pub fn register_field_with(&self, form_id: &FormId, options: FieldOptions) -> FormResult<()> {
        let (id, handle) = {
            let mut state = write_lock(&self.state, "registering field")?;
            let id = match state.register(form_id, options) {
                Ok(id) => id,
                Err(error) => {
                    tracing::warn!(form = %form_id, %error, "rejected field registration");
                    return Err(error);
                }
            };
            let handle = self.start_validation_locked(&mut state, &id, ValidationTrigger::Mount);
            (id, handle)
        };
        tracing::debug!(field = %id, "field registered");
        let mut events = vec![FormEvent::field(&id, FormEventKind::FieldRegistered)];
        events.extend(self.validation_events(&id, handle));
        self.emit(events);
        Ok(())
    }

    pub fn deregister_field(&self, form_id: &FormId, name: impl Into<FieldKey>) -> FormResult<()> {
        let id = FieldId::new(form_id.clone(), name.into());
        let removed = write_lock(&self.state, "deregistering field")?.deregister(&id);
        if removed.is_some() {
            tracing::debug!(field = %id, "field deregistered");
            self.emit(vec![FormEvent::field(&id, FormEventKind::FieldDeregistered)]);
        }
        Ok(())
    }

    pub fn on_change(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        value: impl Into<FieldValue>,
    ) -> FormResult<()> {
        self.set_value(form_id, name, value, true)
    }

    pub fn on_blur(&self, form_id: &FormId, name: impl Into<FieldKey>) -> FormResult<()> {
        self.set_touched(form_id, name)
    }

    pub fn set_value(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        value: impl Into<FieldValue>,
        touched: bool,
    ) -> FormResult<()> {
        let id = FieldId::new(form_id.clone(), name.into());
        let value = value.into();
        let handle = {
            let mut state = write_lock(&self.state, "writing field value")?;
            let updated = state.fields.update(&id, |record| {
                record.value = value;
                record.touched |= touched;
            });
            if updated.is_none() {
                tracing::trace!(field = %id, "ignoring value for unregistered field");
                return Ok(());
            }
            self.start_validation_locked(&mut state, &id, ValidationTrigger::Change)
        };
        let mut events = vec![FormEvent::field(&id, FormEventKind::ValueChanged)];
        events.extend(self.validation_events(&id, handle));
        self.emit(events);
        Ok(())
    }

    /// `on_change` carrying a precomputed outcome: an error settles the
    /// field's validation slot directly, `None` runs the field's validation as
    /// usual. Returns the validation that was started, if any.
    pub fn on_change_with_error(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        value: impl Into<FieldValue>,
        error: Option<FieldError>,
    ) -> FormResult<Option<ValidationHandle>> {
        let id = FieldId::new(form_id.clone(), name.into());
        match self.change_with_error_if(&id, value.into(), error, |_| true)? {
            ChangeCommit::Committed(handle) => Ok(handle),
            ChangeCommit::Discarded => Ok(None),
        }
    }

    pub(super) fn change_with_error_if(
        &self,
        id: &FieldId,
        value: FieldValue,
        error: Option<FieldError>,
        current: impl FnOnce(&StoreState) -> bool,
    ) -> FormResult<ChangeCommit> {
        let (handle, settled) = {
            let mut state = write_lock(&self.state, "writing field value")?;
            if !current(&state) {
                return Ok(ChangeCommit::Discarded);
            }
            let settled = error.is_some();
            let updated = state.fields.update(id, |record| {
                record.value = value;
                record.touched = true;
                if let Some(error) = error {
                    drop(record.settle(Some(error)));
                }
            });
            if updated.is_none() {
                tracing::trace!(field = %id, "ignoring value for unregistered field");
                return Ok(ChangeCommit::Committed(None));
            }
            let handle = if settled {
                None
            } else {
                self.start_validation_locked(&mut state, id, ValidationTrigger::Revalidate)
            };
            (handle, settled)
        };
        let mut events = vec![FormEvent::field(id, FormEventKind::ValueChanged)];
        if settled {
            events.push(FormEvent::field(id, FormEventKind::ValidationCommitted));
        }
        events.extend(self.validation_events(id, handle.clone()));
        self.emit(events);
        Ok(ChangeCommit::Committed(handle))
    }

    pub fn set_touched(&self, form_id: &FormId, name: impl Into<FieldKey>) -> FormResult<()> {
        let id = FieldId::new(form_id.clone(), name.into());
        let handle = {
            let mut state = write_lock(&self.state, "touching field")?;
            if state
                .fields
                .update(&id, |record| record.touched = true)
                .is_none()
            {
                tracing::trace!(field = %id, "ignoring blur for unregistered field");
                return Ok(());
            }
            self.start_validation_locked(&mut state, &id, ValidationTrigger::Blur)
        };
        let mut events = vec![FormEvent::field(&id, FormEventKind::Touched)];
        events.extend(self.validation_events(&id, handle));
        self.emit(events);
        Ok(())
    }

    pub fn set_validator(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        validator: impl FieldValidator,
    ) -> FormResult<()> {
        let id = FieldId::new(form_id.clone(), name.into());
        let validator: ValidatorFn = Arc::new(validator);
        let handle = {
            let mut state = write_lock(&self.state, "replacing field validator")?;
            state
                .fields
                .update(&id, |record| record.validator = Some(validator))
                .ok_or_else(|| unknown_field(&id))?;
            self.start_validation_locked(&mut state, &id, ValidationTrigger::Mount)
        };
        let mut events = vec![FormEvent::field(&id, FormEventKind::ValidatorChanged)];
        events.extend(self.validation_events(&id, handle));
        self.emit(events);
        Ok(())
    }

    pub fn set_required(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        required: bool,
    ) -> FormResult<()> {
        let id = FieldId::new(form_id.clone(), name.into());
        write_lock(&self.state, "updating required flag")?
            .fields
            .update(&id, |record| record.required = required)
            .ok_or_else(|| unknown_field(&id))
    }

    pub fn has_field(&self, form_id: &FormId, name: &str) -> FormResult<bool> {
        let id = FieldId::new(form_id.clone(), FieldKey::from(name));
        Ok(read_lock(&self.state, "checking field record")?
            .fields
            .get(&id)
            .is_some())
    }

    pub fn field_ids(&self, form_id: &FormId) -> FormResult<Vec<FieldKey>> {
        Ok(read_lock(&self.state, "reading field ids")?
            .forms
            .get(form_id)
            .map(|form| form.field_ids.clone())
            .unwrap_or_default())
    }

    pub fn field_meta(&self, form_id: &FormId, name: &str) -> FormResult<Option<FieldMeta>> {
        let id = FieldId::new(form_id.clone(), FieldKey::from(name));
        Ok(read_lock(&self.state, "reading field meta")?
            .fields
            .get(&id)
            .map(FieldRecord::meta))
    }

    pub fn snapshot(&self, form_id: &FormId) -> FormResult<FormSnapshot> {
        Ok(read_lock(&self.state, "creating form snapshot")?.snapshot(form_id))
    }

    pub fn subscribe(
        &self,
        form_id: &FormId,
        listener: impl Fn(&FormEvent) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        let mut listeners = write_lock(&self.listeners, "registering listener")?;
        listeners.next_id += 1;
        let id = SubscriptionId(listeners.next_id);
        listeners
            .entries
            .insert(id, (form_id.clone(), Arc::new(listener)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FormResult<bool> {
        Ok(write_lock(&self.listeners, "removing listener")?
            .entries
            .remove(&id)
            .is_some())
    }

    pub(super) fn emit(&self, events: Vec<FormEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let targets = listeners
            .entries
            .values()
            .filter(|(form_id, _)| events.iter().any(|event| &event.form_id == form_id))
            .map(|(form_id, listener)| (form_id.clone(), listener.clone()))
            .collect::<Vec<_>>();
        drop(listeners);

        for event in &events {
            for (form_id, listener) in &targets {
                if &event.form_id == form_id {
                    listener(event);
                }
            }
        }
    }

    pub(super) fn has_spawner(&self) -> bool {
        self.spawner.is_some()
    }

    pub(super) fn try_spawn<F>(&self, form_id: &FormId, future: F) -> FormResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(spawner) = &self.spawner else {
            return Err(FormError::NoSpawner(form_id.clone()));
        };
        spawner
            .spawn(future)
            .map_err(|error| FormError::SpawnFailed(error.to_string()))
    }

    pub(super) fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(spawner) = &self.spawner else {
            return;
        };
        if let Err(error) = spawner.spawn(future) {
            tracing::warn!(%error, "failed to spawn form task");
        }
    }
}

pub(super) fn unknown_field(id: &FieldId) -> FormError {
    FormError::UnknownField {
        form: id.form.clone(),
        name: id.name.clone(),
    }
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
