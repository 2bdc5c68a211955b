use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};

use super::controller::{
    FieldId, FieldKey, FormController, FormError, FormEvent, FormEventKind, FormId, FormResult,
    read_lock, write_lock,
};
use super::handle::FormHandle;
use super::validation::ValidationTrigger;
use super::value::{FieldError, FormValues, ValueMap};

pub type SubmitFuture = BoxFuture<'static, FormResult<()>>;

pub trait SubmitHandler: Send + Sync + 'static {
    fn submit(&self, payload: SubmitPayload, form: FormHandle) -> SubmitFuture;
}

impl<F, Fut> SubmitHandler for F
where
    F: Fn(SubmitPayload, FormHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FormResult<()>> + Send + 'static,
{
    fn submit(&self, payload: SubmitPayload, form: FormHandle) -> SubmitFuture {
        Box::pin((self)(payload, form))
    }
}

pub(super) type SubmitHandlerFn = Arc<dyn SubmitHandler>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubmitPayload {
    pub form_id: FormId,
    pub ticket: SubmissionTicket,
    pub field_ids: Vec<FieldKey>,
    pub values: ValueMap,
    pub touched: BTreeMap<FieldKey, bool>,
    pub validation: BTreeMap<FieldKey, FieldError>,
}

impl SubmitPayload {
    pub fn has_errors(&self) -> bool {
        !self.validation.is_empty()
    }

    pub fn decode<T>(&self) -> FormResult<T>
    where
        T: FormValues,
    {
        T::from_values(&self.values)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubmissionTicket(pub u64);

#[derive(Clone)]
pub struct SubmissionHandle {
    ticket: SubmissionTicket,
    inner: Shared<SubmitFuture>,
}

impl SubmissionHandle {
    pub fn ticket(&self) -> SubmissionTicket {
        self.ticket
    }

    pub fn is_finished(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl Future for SubmissionHandle {
    type Output = FormResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

pub(super) struct TrackedSubmission {
    pub(super) ticket: SubmissionTicket,
    pub(super) handle: SubmissionHandle,
}

/// Clears the tracked submission unless a newer one replaced it.
struct SubmissionCleanup {
    controller: FormController,
    form_id: FormId,
    ticket: SubmissionTicket,
}

impl Drop for SubmissionCleanup {
    fn drop(&mut self) {
        let cleared = {
            let mut state = match self.controller.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.forms.get_mut(&self.form_id).and_then(|form| {
                let current = form
                    .submission
                    .as_ref()
                    .is_some_and(|tracked| tracked.ticket == self.ticket);
                if current {
                    form.submission.take()
                } else {
                    None
                }
            })
        };
        tracing::debug!(
            form = %self.form_id,
            ticket = self.ticket.0,
            tracked = cleared.is_some(),
            "submission settled"
        );
        if cleared.is_some() {
            self.controller.emit(vec![FormEvent::form(
                &self.form_id,
                FormEventKind::SubmissionFinished,
            )]);
        }
    }
}

impl FormController {
    pub fn set_submit_handler(
        &self,
        form_id: &FormId,
        handler: impl SubmitHandler,
    ) -> FormResult<()> {
        write_lock(&self.state, "installing submit handler")?
            .forms
            .ensure(form_id)
            .submit_handler = Some(Arc::new(handler));
        Ok(())
    }

    pub fn submit(&self, form_id: &FormId) -> FormResult<SubmissionHandle> {
        let (handle, replaced) = {
            let mut state = write_lock(&self.state, "starting submission")?;
            if state.forms.get(form_id).is_none() {
                return Err(FormError::UnknownForm(form_id.clone()));
            }
            let ticket = SubmissionTicket(state.next_ticket());
            let capture = state.capture(form_id);
            let form = state
                .forms
                .get_mut(form_id)
                .ok_or_else(|| FormError::UnknownForm(form_id.clone()))?;
            form.submit_count = form.submit_count.saturating_add(1);
            form.last_ticket = Some(ticket);
            let handler = form.submit_handler.clone();

            let controller = self.clone();
            let target = form_id.clone();
            let future = async move {
                let _cleanup = SubmissionCleanup {
                    controller: controller.clone(),
                    form_id: target.clone(),
                    ticket,
                };
                let validation = controller
                    .validate_form(&target)
                    .await?
                    .into_iter()
                    .filter_map(|(name, error)| error.map(|error| (name, error)))
                    .collect::<BTreeMap<_, _>>();
                let payload = SubmitPayload {
                    form_id: target.clone(),
                    ticket,
                    field_ids: capture.field_ids,
                    values: capture.values,
                    touched: capture.touched,
                    validation,
                };
                tracing::debug!(
                    form = %target,
                    ticket = ticket.0,
                    errors = payload.validation.len(),
                    "running submit handler"
                );
                let Some(handler) = handler else {
                    return Ok(());
                };
                let result = handler.submit(payload, controller.form(target.clone())).await;
                if let Err(error) = &result {
                    tracing::warn!(form = %target, %error, "submit handler failed");
                }
                result
            }
            .boxed();

            let handle = SubmissionHandle {
                ticket,
                inner: future.shared(),
            };
            let replaced = form.submission.replace(TrackedSubmission {
                ticket,
                handle: handle.clone(),
            });
            (handle, replaced)
        };
        // Dropping the previous submission may run its cleanup, which locks
        // the store again.
        drop(replaced);
        self.emit(vec![FormEvent::form(
            form_id,
            FormEventKind::SubmissionStarted,
        )]);
        Ok(handle)
    }

    /// Form-submit binding for the UI: starts a submission and runs it on the
    /// controller's spawner, so nobody has to await the returned handle.
    pub fn handle_submit(&self, form_id: &FormId) -> FormResult<SubmissionHandle> {
        if !self.has_spawner() {
            return Err(FormError::NoSpawner(form_id.clone()));
        }
        let handle = self.submit(form_id)?;
        if let Err(error) = self.try_spawn(form_id, handle.clone().map(|_| ())) {
            tracing::warn!(form = %form_id, %error, "submission could not be spawned");
            self.untrack_submission(form_id, handle.ticket())?;
            return Err(error);
        }
        Ok(handle)
    }

    pub fn is_latest_submission(
        &self,
        form_id: &FormId,
        ticket: SubmissionTicket,
    ) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading latest submission")?
            .is_latest_submission(form_id, ticket))
    }

    fn untrack_submission(&self, form_id: &FormId, ticket: SubmissionTicket) -> FormResult<()> {
        let untracked = write_lock(&self.state, "untracking submission")?
            .forms
            .get_mut(form_id)
            .and_then(|form| {
                let current = form
                    .submission
                    .as_ref()
                    .is_some_and(|tracked| tracked.ticket == ticket);
                if current {
                    form.submission.take()
                } else {
                    None
                }
            });
        if untracked.is_some() {
            drop(untracked);
            self.emit(vec![FormEvent::form(form_id, FormEventKind::SubmissionFinished)]);
        }
        Ok(())
    }

    pub fn current_submission(&self, form_id: &FormId) -> FormResult<Option<SubmissionHandle>> {
        Ok(read_lock(&self.state, "reading current submission")?
            .forms
            .get(form_id)
            .and_then(|form| form.submission.as_ref())
            .map(|tracked| tracked.handle.clone()))
    }

    pub fn is_submitting(&self, form_id: &FormId) -> FormResult<bool> {
        Ok(read_lock(&self.state, "reading submission state")?
            .forms
            .get(form_id)
            .is_some_and(|form| form.submission.is_some()))
    }

    pub fn set_values(&self, form_id: &FormId, values: ValueMap, revalidate: bool) -> FormResult<()> {
        let mut events = Vec::new();
        let mut started = Vec::new();
        {
            let mut state = write_lock(&self.state, "setting form values")?;
            for (name, value) in values {
                let id = FieldId::new(form_id.clone(), name);
                if state
                    .fields
                    .update(&id, |record| record.value = value)
                    .is_none()
                {
                    continue;
                }
                events.push(FormEvent::field(&id, FormEventKind::ValueChanged));
                if revalidate {
                    let handle =
                        self.start_validation_locked(&mut state, &id, ValidationTrigger::Revalidate);
                    started.push((id, handle));
                }
            }
        }
        for (id, handle) in started {
            events.extend(self.validation_events(&id, handle));
        }
        self.emit(events);
        Ok(())
    }

    pub fn set_touched_fields(
        &self,
        form_id: &FormId,
        touched: BTreeMap<FieldKey, bool>,
    ) -> FormResult<()> {
        let mut events = Vec::new();
        {
            let mut state = write_lock(&self.state, "setting touched fields")?;
            for (name, _) in touched.into_iter().filter(|(_, touched)| *touched) {
                let id = FieldId::new(form_id.clone(), name);
                if state
                    .fields
                    .update(&id, |record| record.touched = true)
                    .is_some()
                {
                    events.push(FormEvent::field(&id, FormEventKind::Touched));
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    pub fn reset(&self, form_id: &FormId) -> FormResult<()> {
        {
            let mut state = write_lock(&self.state, "resetting form")?;
            let names = state
                .forms
                .get(form_id)
                .map(|form| form.field_ids.clone())
                .ok_or_else(|| FormError::UnknownForm(form_id.clone()))?;
            for name in names {
                let id = FieldId::new(form_id.clone(), name);
                state.fields.update(&id, |record| {
                    record.value = record.default_value.clone();
                    record.touched = false;
                    drop(record.settle(None));
                });
            }
        }
        tracing::debug!(form = %form_id, "form reset");
        self.emit(vec![FormEvent::form(form_id, FormEventKind::Reset)]);
        Ok(())
    }

    pub fn destroy_form(&self, form_id: &FormId) -> FormResult<bool> {
        let removed = write_lock(&self.state, "destroying form")?.remove_form(form_id);
        let Some(removed) = removed else {
            return Ok(false);
        };
        tracing::debug!(form = %form_id, fields = removed.field_ids.len(), "form destroyed");
        drop(removed);
        self.emit(vec![FormEvent::form(form_id, FormEventKind::FormDestroyed)]);
        Ok(true)
    }

    /// Teardown hook for the owner of a form: destroys it when the form was
    /// mounted with `reset_on_unmount`, keeps its state otherwise.
    pub fn unmount_form(&self, form_id: &FormId) -> FormResult<()> {
        let reset_on_unmount = read_lock(&self.state, "reading unmount policy")?
            .forms
            .get(form_id)
            .is_some_and(|form| form.options.reset_on_unmount);
        if reset_on_unmount {
            self.destroy_form(form_id)?;
        } else {
            tracing::debug!(form = %form_id, "form unmounted, state kept");
        }
        Ok(())
    }
}
