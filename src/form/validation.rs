use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures_timer::Delay;

use super::controller::{
    FieldId, FieldKey, FormController, FormEvent, FormEventKind, FormId, FormResult,
    read_lock, unknown_field, write_lock,
};
use super::guard::EffectGuard;
use super::store::StoreState;
use super::value::{FieldError, FieldValue, ValueMap};

/// Values and touched flags of the other fields in the same form, captured
/// when the validation started.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldBag {
    pub values: ValueMap,
    pub touched: BTreeMap<FieldKey, bool>,
}

pub type BoxedValidationFuture = BoxFuture<'static, Result<(), FieldError>>;

pub trait FieldValidator: Send + Sync + 'static {
    fn validate(&self, value: FieldValue, bag: FieldBag) -> BoxedValidationFuture;
}

impl<F, Fut> FieldValidator for F
where
    F: Fn(FieldValue, FieldBag) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
{
    fn validate(&self, value: FieldValue, bag: FieldBag) -> BoxedValidationFuture {
        Box::pin((self)(value, bag))
    }
}

pub(super) type ValidatorFn = Arc<dyn FieldValidator>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationTrigger {
    Mount,
    Change,
    Blur,
    Revalidate,
    Explicit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationOutcome {
    Committed(Option<FieldError>),
    Discarded,
}

impl ValidationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ValidationOutcome::Committed(_))
    }
}

#[derive(Clone)]
enum HandleState {
    Settled(ValidationOutcome),
    Pending(Shared<BoxFuture<'static, ValidationOutcome>>),
}

#[derive(Clone)]
pub struct ValidationHandle {
    generation: u64,
    state: HandleState,
}

impl ValidationHandle {
    fn pending(generation: u64, future: BoxFuture<'static, ValidationOutcome>) -> Self {
        Self {
            generation,
            state: HandleState::Pending(future.shared()),
        }
    }

    fn settled(generation: u64, outcome: ValidationOutcome) -> Self {
        Self {
            generation,
            state: HandleState::Settled(outcome),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_settled(&self) -> bool {
        match &self.state {
            HandleState::Settled(_) => true,
            HandleState::Pending(shared) => shared.peek().is_some(),
        }
    }
}

impl Future for ValidationHandle {
    type Output = ValidationOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Settled(outcome) => Poll::Ready(outcome.clone()),
            HandleState::Pending(shared) => Pin::new(shared).poll(cx),
        }
    }
}

impl StoreState {
    pub(super) fn commit_validation(
        &mut self,
        id: &FieldId,
        guard: &EffectGuard,
        error: Option<FieldError>,
    ) -> bool {
        let Some(record) = self.fields.get_mut(id) else {
            return false;
        };
        if !guard.belongs_to(&record.scope) {
            return false;
        }
        if let Err(stale) = guard.check_validity() {
            tracing::trace!(field = %id, %stale, "discarding stale validation result");
            return false;
        }
        record.error = error;
        if record
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == guard.generation())
        {
            record.pending = None;
        }
        true
    }
}

impl FormController {
    pub(super) fn start_validation_locked(
        &self,
        state: &mut StoreState,
        id: &FieldId,
        trigger: ValidationTrigger,
    ) -> Option<ValidationHandle> {
        let triggers = state.forms.get(&id.form)?.options.triggers;
        if !triggers.fires_on(trigger) {
            return None;
        }
        let bag = state.bag(id);
        let record = state.fields.get_mut(id)?;

        if record.required && record.value.is_blank() {
            let guard = record.settle(Some(FieldError::required()));
            return Some(ValidationHandle::settled(
                guard.generation(),
                ValidationOutcome::Committed(Some(FieldError::required())),
            ));
        }
        let Some(validator) = record.validator.clone() else {
            let guard = record.settle(None);
            return Some(ValidationHandle::settled(
                guard.generation(),
                ValidationOutcome::Committed(None),
            ));
        };

        let guard = record.scope.begin();
        let generation = guard.generation();
        let value = record.value.clone();
        let debounce = record.debounce;
        let controller = self.clone();
        let field = id.clone();
        let future = async move {
            if !debounce.is_zero() {
                Delay::new(debounce).await;
                if !guard.is_valid() {
                    tracing::trace!(field = %field, "debounced validation superseded");
                    return ValidationOutcome::Discarded;
                }
            }
            let result = AssertUnwindSafe(async move { validator.validate(value, bag).await })
                .catch_unwind()
                .await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(panic) => {
                    let detail = panic_message(&*panic);
                    tracing::warn!(field = %field, %detail, "validator panicked");
                    Some(FieldError::validator_panicked(&detail))
                }
            };
            controller.finish_validation(&field, &guard, error)
        }
        .boxed();

        tracing::trace!(field = %id, ?trigger, generation, "validation started");
        let handle = ValidationHandle::pending(generation, future);
        record.pending = Some(handle.clone());
        Some(handle)
    }

    pub(super) fn validation_events(
        &self,
        id: &FieldId,
        handle: Option<ValidationHandle>,
    ) -> Vec<FormEvent> {
        let Some(handle) = handle else {
            return Vec::new();
        };
        if handle.is_settled() {
            return vec![FormEvent::field(id, FormEventKind::ValidationCommitted)];
        }
        self.spawn_detached(handle.map(|_| ()));
        vec![FormEvent::field(id, FormEventKind::ValidationStarted)]
    }

    fn finish_validation(
        &self,
        id: &FieldId,
        guard: &EffectGuard,
        error: Option<FieldError>,
    ) -> ValidationOutcome {
        let committed = match self.state.write() {
            Ok(mut state) => state.commit_validation(id, guard, error.clone()),
            Err(_) => {
                tracing::warn!(field = %id, "form state poisoned, dropping validation result");
                false
            }
        };
        if !committed {
            return ValidationOutcome::Discarded;
        }
        self.emit(vec![FormEvent::field(id, FormEventKind::ValidationCommitted)]);
        ValidationOutcome::Committed(error)
    }

    pub fn validate_field(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
    ) -> FormResult<ValidationHandle> {
        let id = FieldId::new(form_id.clone(), name.into());
        let handle = {
            let mut state = write_lock(&self.state, "starting field validation")?;
            if state.fields.get(&id).is_none() {
                return Err(unknown_field(&id));
            }
            self.start_validation_locked(&mut state, &id, ValidationTrigger::Explicit)
                .ok_or_else(|| unknown_field(&id))?
        };
        let events = self.validation_events(&id, Some(handle.clone()));
        self.emit(events);
        Ok(handle)
    }

    pub fn pending_validation(
        &self,
        form_id: &FormId,
        name: &str,
    ) -> FormResult<Option<ValidationHandle>> {
        let id = FieldId::new(form_id.clone(), FieldKey::from(name));
        Ok(read_lock(&self.state, "reading pending validation")?
            .fields
            .get(&id)
            .and_then(|record| record.pending.clone()))
    }

    /// Begins a new guard on the field's validation slot for validation run
    /// outside the scheduler; commit its result with
    /// [`FormController::set_validation_result`].
    pub fn field_guard(&self, form_id: &FormId, name: impl Into<FieldKey>) -> FormResult<EffectGuard> {
        let id = FieldId::new(form_id.clone(), name.into());
        let mut state = write_lock(&self.state, "beginning field guard")?;
        let record = state.fields.get_mut(&id).ok_or_else(|| unknown_field(&id))?;
        record.pending = None;
        Ok(record.scope.begin())
    }

    pub fn set_validation_result(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        error: Option<FieldError>,
        guard: &EffectGuard,
    ) -> FormResult<bool> {
        let id = FieldId::new(form_id.clone(), name.into());
        let committed =
            write_lock(&self.state, "committing validation result")?.commit_validation(&id, guard, error);
        if committed {
            self.emit(vec![FormEvent::field(&id, FormEventKind::ValidationCommitted)]);
        }
        Ok(committed)
    }

    pub fn set_errors(
        &self,
        form_id: &FormId,
        errors: BTreeMap<FieldKey, Option<FieldError>>,
    ) -> FormResult<()> {
        let mut events = Vec::new();
        {
            let mut state = write_lock(&self.state, "setting field errors")?;
            for (name, error) in errors {
                let id = FieldId::new(form_id.clone(), name);
                if state
                    .fields
                    .update(&id, |record| drop(record.settle(error)))
                    .is_some()
                {
                    events.push(FormEvent::field(&id, FormEventKind::ValidationCommitted));
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    pub fn set_field_error(
        &self,
        form_id: &FormId,
        name: impl Into<FieldKey>,
        error: Option<FieldError>,
    ) -> FormResult<()> {
        self.set_errors(form_id, BTreeMap::from([(name.into(), error)]))
    }

    pub fn clear_errors(&self, form_id: &FormId) -> FormResult<()> {
        let names = self.field_ids(form_id)?;
        self.set_errors(form_id, names.into_iter().map(|name| (name, None)).collect())
    }

    /// Waits for every current validation of the form and returns the
    /// committed outcome per field, in field order. Validations started while
    /// waiting are waited for as well.
    pub async fn validate_form(
        &self,
        form_id: &FormId,
    ) -> FormResult<Vec<(FieldKey, Option<FieldError>)>> {
        let mut awaited: Option<Vec<u64>> = None;
        loop {
            let pending = read_lock(&self.state, "collecting pending validations")?.pending_of(form_id);
            let generations = pending
                .iter()
                .map(ValidationHandle::generation)
                .collect::<Vec<_>>();
            if pending.is_empty() || awaited.as_ref() == Some(&generations) {
                break;
            }
            future::join_all(pending).await;
            awaited = Some(generations);
        }
        Ok(read_lock(&self.state, "reading validation outcomes")?.outcomes_of(form_id))
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
