// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::Deserialize;
use tracing_core::span::Current;
use tracing::{
    Event, Level, Metadata, Subscriber,
    field::{Field, Visit},
    info_span,
    level_filters::LevelFilter,
    span::{Attributes, Id, Record},
};

use avbpatch::{
    crypto,
    engine::{self, SigningKeys},
    generate,
    profile::{Profile, ProfileConfig},
};

thread_local! {
    static STACK: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct SpanInfo {
    metadata: &'static Metadata<'static>,
    parent: Option<u64>,
}

#[derive(Debug)]
struct LoggedEvent {
    message: String,
    spans: Vec<&'static str>,
}

/// Records every event at info level or above together with the names of
/// the spans it was emitted in, innermost first.
#[derive(Clone, Default)]
struct Recorder {
    next_id: Arc<AtomicU64>,
    spans: Arc<Mutex<HashMap<u64, SpanInfo>>>,
    events: Arc<Mutex<Vec<LoggedEvent>>>,
}

impl Recorder {
    fn current() -> Option<u64> {
        STACK.with(|s| s.borrow().last().copied())
    }

    fn span_names(&self, mut id: Option<u64>) -> Vec<&'static str> {
        let spans = self.spans.lock().unwrap();
        let mut names = vec![];

        while let Some(info) = id.and_then(|i| spans.get(&i)) {
            names.push(info.metadata.name());
            id = info.parent;
        }

        names
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl Subscriber for Recorder {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() <= Level::INFO
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(LevelFilter::INFO)
    }

    fn new_span(&self, attrs: &Attributes<'_>) -> Id {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let parent = if attrs.is_contextual() {
            Self::current()
        } else {
            attrs.parent().map(|p| p.into_u64())
        };

        self.spans.lock().unwrap().insert(
            id,
            SpanInfo {
                metadata: attrs.metadata(),
                parent,
            },
        );

        Id::from_u64(id)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let parent = if event.is_contextual() {
            Self::current()
        } else {
            event.parent().map(|p| p.into_u64())
        };

        self.events.lock().unwrap().push(LoggedEvent {
            message: visitor.0,
            spans: self.span_names(parent),
        });
    }

    fn enter(&self, span: &Id) {
        STACK.with(|s| s.borrow_mut().push(span.into_u64()));
    }

    fn exit(&self, _span: &Id) {
        STACK.with(|s| s.borrow_mut().pop());
    }

    fn current_span(&self) -> Current {
        let spans = self.spans.lock().unwrap();

        match Self::current().and_then(|id| spans.get(&id).map(|s| (id, s.metadata))) {
            Some((id, metadata)) => Current::new(Id::from_u64(id), metadata),
            None => Current::none(),
        }
    }
}

#[derive(Deserialize)]
struct Config {
    profile: BTreeMap<String, ProfileConfig>,
}

fn load_profile(name: &str) -> Profile {
    let data = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../e2e/e2e.toml"));
    let mut config: Config = toml_edit::de::from_str(data).unwrap();

    Profile::from_config(name, config.profile.remove(name).unwrap()).unwrap()
}

fn load_keys(avb: &str, ota_cert: &[u8]) -> SigningKeys {
    SigningKeys {
        avb: crypto::read_pem_key(avb).unwrap(),
        ota_cert: crypto::read_pem_cert(ota_cert).unwrap(),
    }
}

#[test]
fn worker_threads_keep_span_context() {
    let recorder = Recorder::default();
    tracing::subscriber::set_global_default(recorder.clone()).unwrap();

    let cancel_signal = AtomicBool::new(false);
    let orig_keys = load_keys(
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../e2e/keys/ORIG_KEY_DO_NOT_USE_avb.key",
        )),
        include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../e2e/keys/ORIG_KEY_DO_NOT_USE_ota.crt",
        )),
    );
    let test_keys = load_keys(
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../e2e/keys/TEST_KEY_DO_NOT_USE_avb.key",
        )),
        include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../e2e/keys/TEST_KEY_DO_NOT_USE_ota.crt",
        )),
    );
    let profile = load_profile("pixel_v2");

    let original = generate::generate_images(&profile, &orig_keys, &cancel_signal).unwrap();

    info_span!("profile", name = "pixel_v2").in_scope(|| {
        engine::patch_images(&profile, &original, &test_keys, &cancel_signal).unwrap();
    });

    let events = recorder.events.lock().unwrap();
    let finalized = events
        .iter()
        .filter(|e| e.message.starts_with("Finalized "))
        .collect::<Vec<_>>();
    assert_eq!(finalized.len(), profile.partitions().len(), "{events:#?}");

    // Includes the partitions at depth 0, which run on rayon worker threads.
    for event in finalized {
        assert_eq!(
            event.spans,
            ["partition", "level", "profile"],
            "{}",
            event.message,
        );
    }
}
