use super::*;
use futures::executor::{ThreadPool, block_on};
use futures_timer::Delay;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing_test::traced_test;

/// Values starting with `slow` take 100ms to validate, everything else 10ms.
/// Values containing `taken` fail.
fn availability_validator() -> impl FieldValidator {
    |value: FieldValue, _bag: FieldBag| async move {
        let text = value.as_text().unwrap_or_default().to_owned();
        let delay = if text.starts_with("slow") { 100 } else { 10 };
        Delay::new(Duration::from_millis(delay)).await;
        if text.contains("taken") {
            Err(FieldError::new(format!("{text} is taken")))
        } else {
            Ok(())
        }
    }
}

fn text(value: &str) -> FieldValue {
    FieldValue::from(value)
}

fn payload_sink() -> (Arc<Mutex<Vec<SubmitPayload>>>, impl SubmitHandler) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = move |payload: SubmitPayload, _form: FormHandle| {
        let sink = sink.clone();
        async move {
            sink.lock().expect("payload sink").push(payload);
            Ok::<(), FormError>(())
        }
    };
    (received, handler)
}

#[test]
fn registered_field_starts_from_its_default() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "user@example.com")
        .expect("register email");

    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.field_ids, vec![FieldKey::from("email")]);
    assert_eq!(snapshot.values.get("email"), Some(&text("user@example.com")));
    assert_eq!(snapshot.touched.get("email"), Some(&false));
    assert!(snapshot.errors.is_empty());
    assert!(!snapshot.is_submitting);

    let meta = snapshot.fields.get("email").expect("email meta");
    assert!(!meta.dirty);
    assert!(!meta.validating);
}

#[test]
fn initial_values_override_field_defaults() {
    let controller = FormController::new();
    let form = controller
        .mount_form(
            &FormId::from("address"),
            FormOptions {
                initial_values: ValueMap::from([(FieldKey::from("city"), text("Brno"))]),
                ..FormOptions::default()
            },
        )
        .expect("mount form");
    form.register_field("city", "").expect("register city");
    form.register_field("street", "Main").expect("register street");

    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.values.get("city"), Some(&text("Brno")));
    assert_eq!(snapshot.values.get("street"), Some(&text("Main")));
}

#[test]
fn duplicate_registration_keeps_the_first_field() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "first@example.com")
        .expect("register email");

    let error = form
        .register_field("email", "second@example.com")
        .err()
        .expect("duplicate must fail");
    assert_eq!(
        error,
        FormError::DuplicateField {
            form: FormId::from("profile"),
            name: FieldKey::from("email"),
        }
    );

    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.field_ids.len(), 1);
    assert_eq!(snapshot.values.get("email"), Some(&text("first@example.com")));
}

#[test]
fn touched_only_moves_forward_until_reset() {
    let controller = FormController::new();
    let form = controller.form("profile");
    let email = form.register_field("email", "").expect("register email");

    email.on_change("a@example.com").expect("change email");
    assert!(email.meta().expect("meta").expect("email meta").touched);

    controller
        .set_value(form.id(), "email", "b@example.com", false)
        .expect("programmatic value");
    form.set_touched(BTreeMap::from([(FieldKey::from("email"), false)]))
        .expect("untouch is ignored");
    form.set_values(
        ValueMap::from([(FieldKey::from("email"), text("c@example.com"))]),
        true,
    )
    .expect("set values");

    let meta = email.meta().expect("meta").expect("email meta");
    assert!(meta.touched);
    assert_eq!(meta.value, text("c@example.com"));

    form.reset().expect("reset");
    let meta = email.meta().expect("meta").expect("email meta");
    assert!(!meta.touched);
    assert_eq!(meta.value, text(""));
}

#[test]
fn blur_marks_field_touched_without_changing_value() {
    let controller = FormController::new();
    let form = controller.form("profile");
    let email = form
        .register_field("email", "user@example.com")
        .expect("register email");

    email.on_blur().expect("blur");

    let meta = email.meta().expect("meta").expect("email meta");
    assert!(meta.touched);
    assert_eq!(meta.value, text("user@example.com"));
}

#[test]
fn required_field_fails_without_running_its_validator() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let controller = FormController::new();
    let form = controller.form("profile");
    let name = form
        .register_field_with(FieldOptions::new("name", "").required(true).validator(
            move |_value: FieldValue, _bag: FieldBag| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), FieldError>(()) }
            },
        ))
        .expect("register name");

    let meta = name.meta().expect("meta").expect("name meta");
    assert_eq!(meta.error, Some(FieldError::required()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    name.on_change("Jane").expect("change name");
    let pending = name
        .pending_validation()
        .expect("pending")
        .expect("validator runs once the value is filled");
    assert_eq!(block_on(pending), ValidationOutcome::Committed(None));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(name.meta().expect("meta").expect("name meta").error, None);
}

#[test]
fn unchecked_required_box_is_missing() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let terms = form
        .register_field_with(FieldOptions::new("terms", false).required(true))
        .expect("register terms");

    assert_eq!(
        terms.meta().expect("meta").expect("terms meta").error,
        Some(FieldError::required())
    );

    terms.on_change(true).expect("check terms");
    assert_eq!(terms.meta().expect("meta").expect("terms meta").error, None);

    terms.on_change(false).expect("uncheck terms");
    assert_eq!(
        terms.meta().expect("meta").expect("terms meta").error,
        Some(FieldError::required())
    );
}

#[test]
fn validators_see_the_other_fields() {
    let controller = FormController::new();
    let form = controller.form("password");
    form.register_field("password", "secret")
        .expect("register password");
    let confirm = form
        .register_field_with(FieldOptions::new("confirm", "").validator(
            |value: FieldValue, bag: FieldBag| async move {
                if bag.values.get("password") == Some(&value) {
                    Ok(())
                } else {
                    Err(FieldError::new("passwords differ"))
                }
            },
        ))
        .expect("register confirm");

    confirm.on_change("other").expect("change confirm");
    let outcome = block_on(confirm.validate().expect("validate confirm"));
    assert_eq!(
        outcome,
        ValidationOutcome::Committed(Some(FieldError::new("passwords differ")))
    );

    confirm.on_change("secret").expect("change confirm");
    let outcome = block_on(confirm.validate().expect("validate confirm"));
    assert_eq!(outcome, ValidationOutcome::Committed(None));
}

#[test]
fn slower_earlier_validation_never_overwrites_newer_result() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");

    username.on_change("slow-taken").expect("first change");
    let first = username
        .pending_validation()
        .expect("pending")
        .expect("first validation pending");
    username.on_change("fast-free").expect("second change");
    let second = username
        .pending_validation()
        .expect("pending")
        .expect("second validation pending");
    assert!(second.generation() > first.generation());

    let (first, second) = block_on(async { futures::join!(first, second) });
    assert_eq!(first, ValidationOutcome::Discarded);
    assert_eq!(second, ValidationOutcome::Committed(None));

    let meta = username.meta().expect("meta").expect("username meta");
    assert_eq!(meta.error, None);
    assert!(!meta.validating);
}

#[test]
fn faster_stale_validation_is_discarded_too() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");

    username.on_change("fast-free").expect("first change");
    let first = username
        .pending_validation()
        .expect("pending")
        .expect("first validation pending");
    username.on_change("slow-taken").expect("second change");
    let second = username
        .pending_validation()
        .expect("pending")
        .expect("second validation pending");

    let (first, second) = block_on(async { futures::join!(first, second) });
    assert_eq!(first, ValidationOutcome::Discarded);
    assert_eq!(
        second,
        ValidationOutcome::Committed(Some(FieldError::new("slow-taken is taken")))
    );
    assert_eq!(
        username.meta().expect("meta").expect("username meta").error,
        Some(FieldError::new("slow-taken is taken"))
    );
}

#[traced_test]
#[test]
fn stale_validation_discard_is_logged() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");

    username.on_change("slow-free").expect("first change");
    let first = username
        .pending_validation()
        .expect("pending")
        .expect("first validation pending");
    username.on_change("fast-free").expect("second change");

    assert_eq!(block_on(first), ValidationOutcome::Discarded);
    assert!(logs_contain("discarding stale validation result"));
}

#[test]
fn validate_form_waits_for_current_validations_in_field_order() {
    let controller = FormController::new();
    let form = controller.form("signup");
    form.register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");
    form.register_field_with(FieldOptions::new("email", "").required(true))
        .expect("register email");

    form.on_change("username", "slow-taken")
        .expect("change username");
    let outcomes = block_on(form.validate()).expect("validate form");

    assert_eq!(
        outcomes,
        vec![
            (
                FieldKey::from("username"),
                Some(FieldError::new("slow-taken is taken"))
            ),
            (FieldKey::from("email"), Some(FieldError::required())),
        ]
    );
    assert!(form.snapshot().expect("snapshot").validating.is_empty());
}

#[test]
fn validator_panic_becomes_a_field_error() {
    let controller = FormController::new();
    let form = controller.form("profile");
    let nickname = form
        .register_field_with(FieldOptions::new("nickname", "").validator(
            |value: FieldValue, _bag: FieldBag| async move {
                if value.as_text() == Some("explode") {
                    panic!("validator exploded");
                }
                Ok::<(), FieldError>(())
            },
        ))
        .expect("register nickname");

    nickname.on_change("explode").expect("change nickname");
    let outcome = block_on(
        nickname
            .pending_validation()
            .expect("pending")
            .expect("validation pending"),
    );

    let expected = FieldError::validator_panicked("validator exploded");
    assert_eq!(outcome, ValidationOutcome::Committed(Some(expected.clone())));
    assert_eq!(
        nickname.meta().expect("meta").expect("nickname meta").error,
        Some(expected)
    );
}

#[test]
fn debounced_validation_runs_only_for_the_latest_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let controller = FormController::new();
    let form = controller.form("search");
    let query = form
        .register_field_with(FieldOptions::new("query", "").debounce_ms(30).validator(
            move |_value: FieldValue, _bag: FieldBag| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), FieldError>(()) }
            },
        ))
        .expect("register query");

    query.on_change("r").expect("change");
    let first = query.pending_validation().expect("pending").expect("first");
    query.on_change("ru").expect("change");
    let second = query.pending_validation().expect("pending").expect("second");

    let (first, second) = block_on(async { futures::join!(first, second) });
    assert_eq!(first, ValidationOutcome::Discarded);
    assert_eq!(second, ValidationOutcome::Committed(None));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn manual_guard_commits_only_while_current() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "").expect("register email");

    let stale = controller.field_guard(form.id(), "email").expect("guard");
    let current = controller.field_guard(form.id(), "email").expect("guard");

    assert!(
        !controller
            .set_validation_result(form.id(), "email", Some("stale".into()), &stale)
            .expect("commit")
    );
    assert!(
        controller
            .set_validation_result(form.id(), "email", Some("fresh".into()), &current)
            .expect("commit")
    );
    assert_eq!(
        form.snapshot().expect("snapshot").error("email"),
        Some(&FieldError::new("fresh"))
    );
}

#[test]
fn deregistered_field_drops_in_flight_results_and_late_writes() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");

    username.on_change("slow-taken").expect("change username");
    let pending = username
        .pending_validation()
        .expect("pending")
        .expect("validation pending");
    username.deregister().expect("deregister");

    assert_eq!(block_on(pending), ValidationOutcome::Discarded);
    controller
        .set_value(form.id(), "username", "late", true)
        .expect("late write is a no-op");
    controller
        .set_touched(form.id(), "username")
        .expect("late blur is a no-op");

    assert!(!controller.has_field(form.id(), "username").expect("has field"));
    let snapshot = form.snapshot().expect("snapshot");
    assert!(snapshot.field_ids.is_empty());
    assert!(snapshot.values.is_empty());
    assert!(snapshot.errors.is_empty());
}

#[test]
fn deregistered_field_is_left_out_of_the_next_submission() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");
    form.register_field("email", "").expect("register email");
    let (received, handler) = payload_sink();
    form.set_submit_handler(handler).expect("handler");

    username.on_change("slow-taken").expect("change username");
    form.on_change("email", "a@example.com").expect("change email");
    username.deregister().expect("deregister");

    block_on(form.submit().expect("submit")).expect("submission succeeds");

    let received = received.lock().expect("payloads");
    let payload = &received[0];
    assert_eq!(payload.field_ids, vec![FieldKey::from("email")]);
    assert!(!payload.values.contains_key("username"));
    assert!(!payload.touched.contains_key("username"));
    assert!(!payload.validation.contains_key("username"));
    assert_eq!(payload.values.get("email"), Some(&text("a@example.com")));
}

#[test]
fn destroyed_form_stales_every_validation() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");

    username.on_change("slow-taken").expect("change username");
    let pending = username
        .pending_validation()
        .expect("pending")
        .expect("validation pending");
    form.unmount().expect("unmount");

    assert_eq!(block_on(pending), ValidationOutcome::Discarded);
    assert!(!controller.has_form(form.id()).expect("has form"));
}

#[test]
fn unmount_keeps_state_when_configured() {
    let controller = FormController::new();
    let form = controller
        .mount_form(
            &FormId::from("wizard"),
            FormOptions {
                reset_on_unmount: false,
                ..FormOptions::default()
            },
        )
        .expect("mount form");
    form.register_field("step", "one").expect("register step");
    form.on_change("step", "two").expect("change step");

    form.unmount().expect("unmount");

    assert_eq!(
        form.snapshot().expect("snapshot").values.get("step"),
        Some(&text("two"))
    );
}

#[test]
fn reset_restores_defaults_and_drops_in_flight_results() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let username = form
        .register_field_with(
            FieldOptions::new("username", "guest").validator(availability_validator()),
        )
        .expect("register username");

    username.on_change("slow-taken").expect("change username");
    let pending = username
        .pending_validation()
        .expect("pending")
        .expect("validation pending");
    form.reset().expect("reset");

    assert_eq!(block_on(pending), ValidationOutcome::Discarded);
    let meta = username.meta().expect("meta").expect("username meta");
    assert_eq!(meta.value, text("guest"));
    assert!(!meta.touched);
    assert!(!meta.validating);
    assert_eq!(meta.error, None);
}

#[test]
fn triggers_can_be_switched_off_per_form() {
    let controller = FormController::new();
    let form = controller
        .mount_form(
            &FormId::from("quiet"),
            FormOptions {
                triggers: ValidationTriggers {
                    on_change: false,
                    ..ValidationTriggers::default()
                },
                ..FormOptions::default()
            },
        )
        .expect("mount form");
    let name = form
        .register_field_with(FieldOptions::new("name", "Jane").required(true))
        .expect("register name");

    name.on_change("").expect("change name");
    assert_eq!(name.meta().expect("meta").expect("name meta").error, None);

    name.on_blur().expect("blur name");
    assert_eq!(
        name.meta().expect("meta").expect("name meta").error,
        Some(FieldError::required())
    );
}

#[test]
fn submission_uses_values_from_the_moment_of_submit() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "").expect("register email");
    let (received, handler) = payload_sink();
    form.set_submit_handler(handler).expect("handler");

    form.on_change("email", "a@example.com").expect("change");
    let submission = form.submit().expect("submit");
    assert!(form.is_submitting().expect("is submitting"));
    form.on_change("email", "b@example.com").expect("change");

    block_on(submission).expect("submission succeeds");

    let received = received.lock().expect("payloads");
    assert_eq!(received.len(), 1);
    let payload = &received[0];
    assert_eq!(payload.values.get("email"), Some(&text("a@example.com")));
    assert_eq!(payload.touched.get("email"), Some(&true));
    assert_eq!(payload.field_ids, vec![FieldKey::from("email")]);
    assert!(!payload.has_errors());
    assert!(!form.is_submitting().expect("is submitting"));
    assert_eq!(form.snapshot().expect("snapshot").submit_count, 1);
}

#[test]
fn submission_waits_for_pending_validation() {
    let controller = FormController::new();
    let form = controller.form("signup");
    form.register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");
    form.register_field_with(FieldOptions::new("email", "").required(true))
        .expect("register email");
    let (received, handler) = payload_sink();
    form.set_submit_handler(handler).expect("handler");

    form.on_change("username", "slow-taken")
        .expect("change username");
    block_on(form.submit().expect("submit")).expect("submission succeeds");

    let received = received.lock().expect("payloads");
    assert_eq!(
        received[0].validation,
        BTreeMap::from([
            (FieldKey::from("email"), FieldError::required()),
            (
                FieldKey::from("username"),
                FieldError::new("slow-taken is taken")
            ),
        ])
    );
}

#[test]
fn failing_handler_still_clears_submitting() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "a@example.com")
        .expect("register email");
    form.set_submit_handler(|_payload: SubmitPayload, _form: FormHandle| async {
        Err::<(), FormError>(FormError::SubmitRejected("server said no".to_string()))
    })
    .expect("handler");

    let submission = form.submit().expect("submit");
    assert!(form.is_submitting().expect("is submitting"));

    let result = block_on(submission);
    assert_eq!(
        result,
        Err(FormError::SubmitRejected("server said no".to_string()))
    );
    assert!(!form.is_submitting().expect("is submitting"));
}

#[test]
fn handle_submit_runs_on_the_spawner() {
    let pool = ThreadPool::new().expect("thread pool");
    let controller = FormController::new().with_spawner(pool);
    let form = controller.form("profile");
    form.register_field("email", "a@example.com")
        .expect("register email");
    let (received, handler) = payload_sink();
    form.set_submit_handler(handler).expect("handler");

    drop(form.handle_submit().expect("handle submit"));

    let mut delivered = 0;
    let mut submitting = true;
    for _ in 0..100 {
        delivered = received.lock().expect("payloads").len();
        submitting = form.is_submitting().expect("is submitting");
        if delivered == 1 && !submitting {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(delivered, 1);
    assert!(!submitting);
    assert_eq!(
        received.lock().expect("payloads")[0].values.get("email"),
        Some(&text("a@example.com"))
    );
}

#[test]
fn handle_submit_requires_a_spawner() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "a@example.com")
        .expect("register email");
    let (received, handler) = payload_sink();
    form.set_submit_handler(handler).expect("handler");

    let error = form.handle_submit().err().expect("no spawner configured");

    assert_eq!(error, FormError::NoSpawner(FormId::from("profile")));
    assert!(!form.is_submitting().expect("is submitting"));
    assert_eq!(form.snapshot().expect("snapshot").submit_count, 0);
    assert!(received.lock().expect("payloads").is_empty());

    block_on(form.submit().expect("submit")).expect("awaited submission still works");
    assert_eq!(received.lock().expect("payloads").len(), 1);
}

#[test]
fn newer_submission_replaces_the_tracked_one() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "a@example.com")
        .expect("register email");
    form.set_submit_handler(move |_payload: SubmitPayload, _form: FormHandle| {
        seen.fetch_add(1, Ordering::SeqCst);
        async {
            Delay::new(Duration::from_millis(10)).await;
            Ok::<(), FormError>(())
        }
    })
    .expect("handler");

    let first = form.submit().expect("first submit");
    let second = form.submit().expect("second submit");
    assert_eq!(
        controller
            .current_submission(form.id())
            .expect("current")
            .map(|handle| handle.ticket()),
        Some(second.ticket())
    );

    block_on(first).expect("first submission runs to completion");
    assert!(form.is_submitting().expect("second still tracked"));

    block_on(second).expect("second submission succeeds");
    assert!(!form.is_submitting().expect("is submitting"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(form.snapshot().expect("snapshot").submit_count, 2);
}

#[test]
fn submit_handler_mutates_the_form_through_its_handle() {
    let controller = FormController::new();
    let form = controller.form("profile");
    form.register_field("email", "").expect("register email");
    form.register_field("status", "draft")
        .expect("register status");
    form.set_submit_handler(|_payload: SubmitPayload, form: FormHandle| async move {
        form.set_values(
            ValueMap::from([(FieldKey::from("status"), text("sent"))]),
            false,
        )?;
        form.set_errors(BTreeMap::from([(
            FieldKey::from("email"),
            Some(FieldError::new("rejected by server")),
        )]))?;
        Ok::<(), FormError>(())
    })
    .expect("handler");

    block_on(form.submit().expect("submit")).expect("submission succeeds");

    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.values.get("status"), Some(&text("sent")));
    assert_eq!(
        snapshot.error("email"),
        Some(&FieldError::new("rejected by server"))
    );
}

#[test]
fn submitting_unknown_form_is_rejected() {
    let controller = FormController::new();
    let error = controller
        .submit(&FormId::from("missing"))
        .err()
        .expect("unknown form");
    assert_eq!(error, FormError::UnknownForm(FormId::from("missing")));
}

#[test]
fn binding_refuses_a_new_identity() {
    let controller = FormController::new();
    let form = controller.form("profile");
    let email = form.register_field("email", "").expect("register email");

    assert!(email.check_identity(form.id(), "email").is_ok());
    assert_eq!(
        email.check_identity(form.id(), "mail"),
        Err(FormError::FieldRenamed {
            form: FormId::from("profile"),
            registered: FieldKey::from("email"),
            requested: FieldKey::from("mail"),
        })
    );
    assert!(matches!(
        email.check_identity(&FormId::from("other"), "email"),
        Err(FormError::FormChanged { .. })
    ));
}

#[test]
fn listeners_only_hear_their_own_form() {
    let controller = FormController::new();
    let profile = controller.form("profile");
    let other = controller.form("other");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = profile
        .subscribe(move |event: &FormEvent| {
            sink.lock().expect("events").push(event.clone());
        })
        .expect("subscribe");

    profile.register_field("email", "").expect("register email");
    profile.on_change("email", "a@example.com").expect("change");
    profile.on_blur("email").expect("blur");
    other.register_field("email", "").expect("register other");

    let kinds = events
        .lock()
        .expect("events")
        .iter()
        .map(|event| {
            assert_eq!(event.form_id, FormId::from("profile"));
            event.kind
        })
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            FormEventKind::FieldRegistered,
            FormEventKind::ValidationCommitted,
            FormEventKind::ValueChanged,
            FormEventKind::ValidationCommitted,
            FormEventKind::Touched,
            FormEventKind::ValidationCommitted,
        ]
    );

    assert!(controller.unsubscribe(subscription).expect("unsubscribe"));
    profile.on_change("email", "b@example.com").expect("change");
    assert_eq!(events.lock().expect("events").len(), 6);
}

#[test]
fn spawner_drives_validations_without_an_awaiting_caller() {
    let pool = ThreadPool::new().expect("thread pool");
    let controller = FormController::new().with_spawner(pool);
    let form = controller.form("signup");
    let username = form
        .register_field_with(FieldOptions::new("username", "").validator(availability_validator()))
        .expect("register username");

    username.on_change("fast-taken").expect("change username");

    let mut meta = username.meta().expect("meta").expect("username meta");
    for _ in 0..100 {
        if !meta.validating {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        meta = username.meta().expect("meta").expect("username meta");
    }
    assert!(!meta.validating);
    assert_eq!(meta.error, Some(FieldError::new("fast-taken is taken")));
}

#[test]
fn controller_is_shared_across_threads() {
    let controller = FormController::new();
    let form = controller.form("counter");
    for index in 0..8 {
        form.register_field(format!("field_{index}"), 0_i64)
            .expect("register field");
    }

    let workers = (0..8)
        .map(|index| {
            let form = form.clone();
            thread::spawn(move || {
                for value in 1..=20_i64 {
                    form.on_change(format!("field_{index}"), value)
                        .expect("change field");
                }
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().expect("worker");
    }

    let snapshot = form.snapshot().expect("snapshot");
    for index in 0..8 {
        assert_eq!(
            snapshot.values.get(format!("field_{index}").as_str()),
            Some(&FieldValue::from(20_i64))
        );
    }
}

#[allow(dead_code)]
#[derive(Clone, Debug, PartialEq, FormValues)]
struct Signup {
    email: String,
    age: i64,
    newsletter: bool,
    budget: Decimal,
    nickname: Option<String>,
}

#[test]
fn derived_values_register_and_decode() {
    let controller = FormController::new();
    let form = controller.form("signup");
    let defaults = Signup {
        email: "user@example.com".to_string(),
        age: 30,
        newsletter: false,
        budget: Decimal::from_i128_with_scale(1200, 2),
        nickname: None,
    };
    let bindings = form.register_model(&defaults).expect("register model");
    assert_eq!(bindings.len(), Signup::field_names().len());

    form.on_change("newsletter", true).expect("change newsletter");
    form.on_change("nickname", "jj").expect("change nickname");
    let (received, handler) = payload_sink();
    form.set_submit_handler(handler).expect("handler");
    block_on(form.submit().expect("submit")).expect("submission succeeds");

    let decoded = received.lock().expect("payloads")[0]
        .decode::<Signup>()
        .expect("decode payload");
    assert_eq!(
        decoded,
        Signup {
            newsletter: true,
            nickname: Some("jj".to_string()),
            ..defaults
        }
    );

    form.on_change("age", "thirty").expect("change age");
    let error = Signup::from_values(&form.snapshot().expect("snapshot").values)
        .err()
        .expect("text age does not decode");
    assert_eq!(
        error,
        FormError::Decode {
            field: FieldKey::from("age"),
            expected: "an integer",
        }
    );
}

/// Schema of the composed field in the tests below: `a` and `b` are required
/// text children seeded from the current values; `c` is optional and only
/// offered while `b` is not `short`.
fn schema_for(seed: &ValueMap) -> Vec<SchemaEntry> {
    let seeded = |name: &str| {
        seed.get(name)
            .and_then(FieldValue::as_text)
            .unwrap_or_default()
            .to_owned()
    };
    let mut schema = vec![
        SchemaEntry::new("a", seeded("a")).label("A"),
        SchemaEntry::new("b", seeded("b")).label("B"),
    ];
    if seeded("b") != "short" {
        schema.push(
            SchemaEntry::new("c", "filled")
                .required(false)
                .refresh(RefreshPolicy::NoRefresh),
        );
    }
    schema
}

/// Fetches `schema_for(seed)` after `delay(seed)` milliseconds; a seed with
/// `a = broken` fails.
fn schema_provider(calls: Arc<AtomicUsize>, delay: fn(&ValueMap) -> u64) -> impl SchemaProvider {
    move |seed: ValueMap| {
        calls.fetch_add(1, Ordering::SeqCst);
        let wait = Duration::from_millis(delay(&seed));
        async move {
            Delay::new(wait).await;
            if seed.get("a").and_then(FieldValue::as_text) == Some("broken") {
                return Err(SchemaFetchError::Request("service unavailable".to_string()));
            }
            Ok(schema_for(&seed))
        }
    }
}

fn quick(_seed: &ValueMap) -> u64 {
    10
}

fn parent_error(form: &FormHandle) -> Option<FieldError> {
    form.snapshot()
        .expect("parent snapshot")
        .errors
        .get("config")
        .cloned()
}

fn parent_value(form: &FormHandle) -> ValueMap {
    form.snapshot()
        .expect("parent snapshot")
        .values
        .get("config")
        .and_then(FieldValue::as_map)
        .cloned()
        .unwrap_or_default()
}

#[test]
fn composed_field_propagates_nested_values_and_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::new(),
        schema_provider(calls.clone(), quick),
    )
    .expect("mount composed field");

    assert_eq!(parent_error(&order), Some(FieldError::not_ready()));
    assert!(composed.is_loading());

    let outcome = block_on(composed.start()).expect("start");
    assert_eq!(outcome, SchemaOutcome::Applied);
    assert!(!composed.is_loading());
    assert_eq!(composed.schema().expect("schema").len(), 3);
    assert_eq!(
        parent_error(&order),
        Some(FieldError::new("Fields a, b is missing."))
    );
    assert_eq!(parent_value(&order).get("c"), Some(&text("filled")));

    let outcome = block_on(composed.on_child_change("a", "x")).expect("change a");
    assert_eq!(outcome, SchemaOutcome::Applied);
    assert_eq!(
        parent_error(&order),
        Some(FieldError::new("Fields b is missing."))
    );

    let outcome = block_on(composed.on_child_change("b", "y")).expect("change b");
    assert_eq!(outcome, SchemaOutcome::Applied);
    assert_eq!(parent_error(&order), None);
    assert_eq!(
        parent_value(&order),
        ValueMap::from([
            (FieldKey::from("a"), text("x")),
            (FieldKey::from("b"), text("y")),
            (FieldKey::from("c"), text("filled")),
        ])
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let nested = controller
        .snapshot(composed.nested_form_id())
        .expect("nested snapshot");
    assert_eq!(order.snapshot().expect("parent").field_ids.len(), 1);
    assert_eq!(
        nested.fields.get("a").and_then(|meta| meta.label.clone()),
        Some("A".to_string())
    );
}

#[test]
fn no_refresh_child_only_resubmits() {
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::from([
            (FieldKey::from("a"), text("x")),
            (FieldKey::from("b"), text("y")),
        ]),
        schema_provider(calls.clone(), quick),
    )
    .expect("mount composed field");
    block_on(composed.start()).expect("start");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let outcome = block_on(composed.on_child_change("c", "manual")).expect("change c");

    assert_eq!(outcome, SchemaOutcome::Resubmitted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(parent_value(&order).get("c"), Some(&text("manual")));
    assert_eq!(parent_error(&order), None);
}

#[test]
fn superseded_nested_submission_keeps_the_newer_values() {
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::from([
            (FieldKey::from("a"), text("x")),
            (FieldKey::from("b"), text("y")),
        ]),
        schema_provider(calls, quick),
    )
    .expect("mount composed field");
    block_on(composed.start()).expect("start");
    controller
        .set_validator(composed.nested_form_id(), "c", availability_validator())
        .expect("validator on c");

    let (slow, fast) = block_on(async {
        futures::join!(
            composed.on_child_change("c", "slow-value"),
            composed.on_child_change("c", "fast-value")
        )
    });

    assert_eq!(slow.expect("slow change"), SchemaOutcome::Stale);
    assert_eq!(fast.expect("fast change"), SchemaOutcome::Resubmitted);
    let nested = controller
        .snapshot(composed.nested_form_id())
        .expect("nested snapshot");
    assert_eq!(nested.values.get("c"), Some(&text("fast-value")));
    assert_eq!(parent_value(&order).get("c"), Some(&text("fast-value")));
    assert_eq!(parent_error(&order), None);
}

#[test]
fn newer_refetch_discards_the_older_one() {
    fn slow_unless_b_changed(seed: &ValueMap) -> u64 {
        if seed.get("b").and_then(FieldValue::as_text) == Some("changed") {
            10
        } else {
            100
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::new(),
        schema_provider(calls, slow_unless_b_changed),
    )
    .expect("mount composed field");
    block_on(composed.start()).expect("start");

    let (from_a, from_b) = block_on(async {
        futures::join!(
            composed.on_child_change("a", "x"),
            composed.on_child_change("b", "changed")
        )
    });

    assert_eq!(from_a.expect("change a"), SchemaOutcome::Stale);
    assert_eq!(from_b.expect("change b"), SchemaOutcome::Applied);
    assert_eq!(
        parent_value(&order).get("b"),
        Some(&text("changed"))
    );
    assert_eq!(parent_error(&order), None);
}

#[test]
fn failed_fetch_is_reported_and_retried_on_next_change() {
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::from([(FieldKey::from("b"), text("y"))]),
        schema_provider(calls.clone(), quick),
    )
    .expect("mount composed field");
    block_on(composed.start()).expect("start");

    let outcome = block_on(composed.on_child_change("a", "broken")).expect("change a");
    assert_eq!(outcome, SchemaOutcome::Failed);
    assert_eq!(parent_error(&order), Some(FieldError::fetch_failed()));

    let outcome = block_on(composed.on_child_change("a", "fixed")).expect("change a");
    assert_eq!(outcome, SchemaOutcome::Applied);
    assert_eq!(parent_error(&order), None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn panicking_provider_is_a_failed_fetch() {
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::new(),
        |_seed: ValueMap| async move {
            if true {
                panic!("provider exploded");
            }
            Ok::<Vec<SchemaEntry>, SchemaFetchError>(Vec::new())
        },
    )
    .expect("mount composed field");

    assert_eq!(
        block_on(composed.start()).expect("start"),
        SchemaOutcome::Failed
    );
    assert_eq!(parent_error(&order), Some(FieldError::fetch_failed()));
}

#[test]
fn schema_replacement_removes_vanished_children() {
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::from([(FieldKey::from("a"), text("x"))]),
        schema_provider(calls, quick),
    )
    .expect("mount composed field");
    block_on(composed.start()).expect("start");
    assert!(
        controller
            .has_field(composed.nested_form_id(), "c")
            .expect("has c")
    );

    block_on(composed.on_child_change("b", "short")).expect("change b");

    assert_eq!(
        controller
            .field_ids(composed.nested_form_id())
            .expect("nested fields"),
        vec![FieldKey::from("a"), FieldKey::from("b")]
    );
    assert!(!parent_value(&order).contains_key("c"));
    assert_eq!(
        composed
            .schema()
            .expect("schema")
            .iter()
            .map(|entry| entry.name.as_str().to_owned())
            .collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string()]
    );
}

#[test]
fn unknown_child_change_is_rejected() {
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::new(),
        schema_provider(Arc::new(AtomicUsize::new(0)), quick),
    )
    .expect("mount composed field");

    let error = block_on(composed.on_child_change("ghost", "boo"))
        .err()
        .expect("ghost is not a child");
    assert!(matches!(error, FormError::UnknownField { .. }));
}

#[test]
fn teardown_stales_the_in_flight_fetch() {
    let controller = FormController::new();
    let order = controller.form("order");
    let composed = ComposedField::mount(
        &controller,
        order.id(),
        "config",
        ValueMap::new(),
        schema_provider(Arc::new(AtomicUsize::new(0)), quick),
    )
    .expect("mount composed field");

    let (outcome, teardown) = block_on(async {
        futures::join!(composed.start(), async { composed.teardown() })
    });

    teardown.expect("teardown");
    assert_eq!(outcome.expect("start"), SchemaOutcome::Stale);
    assert!(
        !controller
            .has_form(composed.nested_form_id())
            .expect("has nested form")
    );
    assert!(!controller.has_field(order.id(), "config").expect("has config"));
}
