use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_apply::{ReconcileOpts, Reconciler};
use keel_config::{ChangeRuleBinding, Conf, Config};
use keel_core::{ApiFailure, Error, Resource, ResourceMatcher};
use keel_kubehub::memory::Verb;
use keel_kubehub::MemoryGateway;
use serde_json::{json, Value as Json};
use tokio::time::Instant;

fn res(v: Json) -> Resource { Resource::from_value(v).unwrap() }

fn opts() -> ReconcileOpts {
    ReconcileOpts::default().with_wait_timeout(Duration::from_secs(60)).with_wait_check_interval(Duration::from_secs(1))
}

fn reconciler(mem: &Arc<MemoryGateway>, conf: Conf, opts: ReconcileOpts) -> Reconciler { Reconciler::new(mem.clone(), conf, opts) }

fn position(calls: &[String], call: &str) -> usize {
    calls.iter().position(|c| c == call).unwrap_or_else(|| panic!("missing call '{}' in {:?}", call, calls))
}

fn config_map(name: &str, data: Json) -> Resource {
    res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns", "labels": {"team": "x"}}, "data": data}))
}

#[tokio::test(start_paused = true)]
async fn namespace_applies_before_its_contents() {
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    let desired = vec![
        res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "app-config", "namespace": "app1"}, "data": {"k": "v"}})),
        res(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "app1"}})),
    ];

    let plan = rec.plan(vec![], desired).unwrap();
    let graph = plan.graph();
    let cm = graph.all_matching(|c| c.resource().kind() == "ConfigMap")[0];
    let ns = graph.all_matching(|c| c.resource().kind() == "Namespace")[0];
    assert_eq!(graph.waiting_for(cm).collect::<Vec<_>>(), vec![ns]);
    assert_eq!(plan.summary().add, 2);

    let report = rec.apply(plan).await.unwrap();
    assert_eq!((report.applied, report.batches), (2, 2));

    let calls = mem.calls();
    assert!(position(&calls, "create namespace/app1") < position(&calls, "get namespace/app1"));
    assert!(position(&calls, "get namespace/app1") < position(&calls, "create configmap/app-config"));
}

#[tokio::test(start_paused = true)]
async fn versioned_secret_is_renamed_and_referenced() {
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    let desired = vec![
        res(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s", "namespace": "ns", "annotations": {"keel.dev/versioned": ""}}, "data": {"k": "djE="}})),
        res(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "ns", "annotations": {"keel.dev/disable-wait": ""}},
            "spec": {"template": {"spec": {"containers": [{"name": "c", "image": "i"}], "volumes": [{"name": "v", "secret": {"secretName": "s"}}]}}}
        })),
    ];

    let plan = rec.plan(vec![], desired).unwrap();
    let names: Vec<&str> = plan.changes().map(|c| c.resource().name()).collect();
    assert!(names.contains(&"s-ver-1"), "names={:?}", names);
    assert!(!names.contains(&"s"));
    let dep = plan.changes().find(|c| c.resource().kind() == "Deployment").unwrap();
    assert_eq!(dep.new_resource().unwrap().as_map()["spec"]["template"]["spec"]["volumes"][0]["secret"]["secretName"], json!("s-ver-1"));

    rec.apply(plan).await.unwrap();
    let secret = mem.stored(&res(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s-ver-1", "namespace": "ns"}})));
    assert!(secret.is_some());
}

#[tokio::test(start_paused = true)]
async fn update_conflict_is_recalculated_and_retried() {
    let latency = Duration::from_millis(100);
    let mem = Arc::new(MemoryGateway::new().with_latency(latency));
    mem.insert(config_map("c", json!({"k": "1"})));
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());

    let existing = rec.fetch_existing("team=x").await.unwrap();
    let plan = rec.plan(existing, vec![config_map("c", json!({"k": "2"}))]).unwrap();
    assert_eq!(plan.summary().update, 1);

    mem.fail_next(Verb::Update, "c", Error::Conflict(ApiFailure::new(409, "Conflict", "the object has been modified")));
    let t0 = Instant::now();
    rec.apply(plan).await.unwrap();
    assert!(t0.elapsed() < latency * 10, "took {:?}", t0.elapsed());

    let stored = mem.stored(&config_map("c", json!({}))).unwrap();
    assert_eq!(stored.as_map()["data"]["k"], json!("2"));
    assert!(stored.has_annotation("keel.dev/original"));
    // failed update, recalculated update, last-applied record
    assert_eq!(mem.count(Verb::Update), 3);
}

#[tokio::test(start_paused = true)]
async fn update_conflict_after_drift_is_refused() {
    let mem = Arc::new(MemoryGateway::new());
    mem.insert(config_map("c", json!({"k": "1"})));
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    let existing = rec.fetch_existing("team=x").await.unwrap();
    let plan = rec.plan(existing, vec![config_map("c", json!({"k": "2"}))]).unwrap();

    mem.fail_next(Verb::Update, "c", Error::Conflict(ApiFailure::new(409, "Conflict", "the object has been modified")));
    let drifted = AtomicBool::new(false);
    mem.on_call(move |verb, key, store| {
        if verb == Verb::Get && !drifted.swap(true, Ordering::SeqCst) {
            if let Some(key) = key {
                store.mutate(key, |r| r.as_map_mut()["data"]["extra"] = json!("third-party"));
            }
        }
    });

    let err = rec.apply(plan).await.unwrap_err();
    match err.root() {
        Error::DriftDetected { source, .. } => assert!(source.is_conflict(), "source={}", source),
        other => panic!("expected drift, got {}", other),
    }
    let stored = mem.stored(&config_map("c", json!({}))).unwrap();
    assert_eq!(stored.as_map()["data"]["k"], json!("1"));
}

#[tokio::test(start_paused = true)]
async fn invalid_update_falls_back_to_replace() {
    let pvc = |size: &str| {
        res(json!({
            "apiVersion": "v1", "kind": "PersistentVolumeClaim",
            "metadata": {"name": "p", "namespace": "ns", "labels": {"team": "x"}, "annotations": {"keel.dev/update-strategy": "fallback-on-replace"}},
            "spec": {"accessModes": ["ReadWriteOnce"], "resources": {"requests": {"storage": size}}}
        }))
    };
    let mem = Arc::new(MemoryGateway::new());
    let mut live = pvc("1Gi");
    live.as_map_mut()["metadata"]["finalizers"] = json!(["kubernetes.io/pvc-protection"]);
    let old_uid = mem.insert(live).uid().map(str::to_string);

    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    let existing = rec.fetch_existing("team=x").await.unwrap();
    let plan = rec.plan(existing, vec![pvc("500Mi")]).unwrap();
    assert_eq!(plan.summary().update, 1);

    mem.fail_next(Verb::Update, "p", Error::Invalid(ApiFailure::new(422, "Invalid", "spec.resources.requests.storage: field can not be less than previous value")));
    let polls = AtomicUsize::new(0);
    mem.on_call(move |verb, key, store| {
        if verb == Verb::Exists && polls.fetch_add(1, Ordering::SeqCst) == 2 {
            if let Some(key) = key {
                store.remove(key);
            }
        }
    });

    let t0 = Instant::now();
    rec.apply(plan).await.unwrap();
    assert_eq!(t0.elapsed(), Duration::from_secs(2));

    let calls = mem.calls();
    assert_eq!(mem.count(Verb::Exists), 3);
    assert!(position(&calls, "delete persistentvolumeclaim/p") < position(&calls, "create persistentvolumeclaim/p"));
    let stored = mem.stored(&pvc("500Mi")).unwrap();
    assert_eq!(stored.as_map()["spec"]["resources"]["requests"]["storage"], json!("500Mi"));
    assert_ne!(stored.uid().map(str::to_string), old_uid);
}

#[tokio::test(start_paused = true)]
async fn cyclical_optional_rule_is_dropped() {
    let cm = |name: &str, group: &str, rule: Option<&str>| {
        let mut r = config_map(name, json!({"k": name}));
        r.set_annotation("keel.dev/change-group", group);
        if let Some(rule) = rule {
            r.set_annotation("keel.dev/change-rule", rule);
        }
        r
    };
    let user = Config {
        change_rule_bindings: vec![ChangeRuleBinding {
            rules: vec!["upsert after upserting x.io/a".into()],
            ignore_if_cyclical: true,
            resource_matchers: vec![ResourceMatcher::kind_namespace_name("ConfigMap", "ns", "c")],
        }],
        ..Config::new()
    };
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![user]).unwrap(), opts());
    let desired = vec![
        cm("a", "x.io/a", Some("upsert after upserting x.io/b")),
        cm("b", "x.io/b", Some("upsert after upserting x.io/c")),
        cm("c", "x.io/c", None),
    ];

    let plan = rec.plan(vec![], desired).unwrap();
    let report = rec.apply(plan).await.unwrap();
    assert_eq!(report.batches, 3);

    let calls = mem.calls();
    assert!(position(&calls, "create configmap/c") < position(&calls, "create configmap/b"));
    assert!(position(&calls, "create configmap/b") < position(&calls, "create configmap/a"));
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_at_deadline() {
    let timeout = Duration::from_secs(30);
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts().with_wait_timeout(timeout));
    let dep = res(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "d", "namespace": "ns", "annotations": {"keel.dev/change-group": "x.io/dep"}},
        "spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "c", "image": "i"}]}}}
    }));
    let mut after = config_map("after", json!({"k": "v"}));
    after.set_annotation("keel.dev/change-rule", "upsert after upserting x.io/dep");

    let plan = rec.plan(vec![], vec![dep, after.clone()]).unwrap();
    let t0 = Instant::now();
    let err = rec.apply(plan).await.unwrap_err();
    assert!(matches!(err.root(), Error::Timeout(t) if *t == timeout), "err={}", err);
    assert_eq!(t0.elapsed(), timeout);
    assert!(mem.stored(&after).is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_convergence_aborts() {
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    let job = res(json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "j", "namespace": "ns"}, "spec": {"template": {"spec": {"containers": []}}}}));
    let plan = rec.plan(vec![], vec![job]).unwrap();

    let failed = AtomicBool::new(false);
    mem.on_call(move |verb, key, store| {
        if verb == Verb::Get && key.map_or(false, |k| k.kind == "Job") && !failed.swap(true, Ordering::SeqCst) {
            if let Some(key) = key {
                store.mutate(key, |r| {
                    r.as_map_mut().insert("status".into(), json!({"conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded"}]}));
                });
            }
        }
    });

    let err = rec.apply(plan).await.unwrap_err();
    match err.root() {
        Error::ConvergenceFailed { message, .. } => assert!(message.contains("BackoffLimitExceeded"), "message={}", message),
        other => panic!("expected convergence failure, got {}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn deletes_and_orphans_previous_resources() {
    let mem = Arc::new(MemoryGateway::new());
    let opts = opts().with_app_label("shop");
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts);
    let mut orphaned = config_map("keep-me", json!({"k": "v"}));
    orphaned.set_annotation("keel.dev/delete-strategy", "orphan");
    rec.reconcile(vec![config_map("gone", json!({"k": "v"})), orphaned.clone()]).await.unwrap();
    assert_eq!(mem.len(), 2);

    // A controller-made object carrying the app label is left alone.
    let mut foreign = config_map("foreign", json!({}));
    foreign.set_label("keel.dev/app", "shop");
    mem.insert(foreign.clone());

    let report = rec.reconcile(vec![]).await.unwrap();
    assert_eq!(report.applied, 2);
    assert!(mem.stored(&config_map("gone", json!({}))).is_none());
    let kept = mem.stored(&orphaned).unwrap();
    assert!(kept.has_annotation("keel.dev/orphaned"));
    assert!(kept.label("keel.dev/app").is_none());
    assert!(mem.stored(&foreign).is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_waiting() {
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    let desired = vec![res(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "stuck", "namespace": "ns", "annotations": {"keel.dev/disable-associated-resources-wait": ""}},
        "spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "c", "image": "i"}]}}}
    }))];

    let set = rec.change_set(rec.plan(vec![], desired).unwrap()).unwrap();
    let token = set.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
    });

    let t0 = Instant::now();
    let err = set.apply().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "err={}", err);
    assert_eq!(t0.elapsed(), Duration::from_secs(5));
    assert_eq!(mem.count(Verb::Create), 1);
}

fn unwaited(name: &str) -> Resource {
    let mut r = config_map(name, json!({"k": name}));
    r.set_annotation("keel.dev/disable-wait", "");
    r
}

#[tokio::test(start_paused = true)]
async fn concurrency_caps_applies() {
    let latency = Duration::from_millis(100);
    // create plus last-applied record per change
    for (limit, expected_ms) in [(0, 200), (2, 400), (1, 800)] {
        let mem = Arc::new(MemoryGateway::new().with_latency(latency));
        let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts().with_concurrency(limit));
        let plan = rec.plan(vec![], ["a", "b", "c", "d"].into_iter().map(unwaited).collect()).unwrap();

        let t0 = Instant::now();
        let report = rec.apply(plan).await.unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(t0.elapsed(), Duration::from_millis(expected_ms), "concurrency {}", limit);
        assert_eq!(mem.count(Verb::Create), 4);
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_caps_wait_polls() {
    let latency = Duration::from_millis(100);
    let desired: Vec<Resource> = (0..4)
        .map(|i| {
            let mut r = config_map(&format!("e{}", i), json!({}));
            r.set_annotation("keel.dev/exists", "");
            r
        })
        .collect();
    for (limit, expected_ms) in [(0, 100), (2, 200), (1, 400)] {
        let mem = Arc::new(MemoryGateway::new().with_latency(latency));
        for r in &desired {
            mem.insert(r.clone());
        }
        let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts().with_concurrency(limit));
        let plan = rec.plan(vec![], desired.clone()).unwrap();

        let t0 = Instant::now();
        rec.apply(plan).await.unwrap();
        assert_eq!(t0.elapsed(), Duration::from_millis(expected_ms), "concurrency {}", limit);
        assert_eq!(mem.count(Verb::Create), 0);
        assert_eq!(mem.count(Verb::Exists), 4);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_apply_lets_the_batch_drain() {
    let mem = Arc::new(MemoryGateway::new().with_latency(Duration::from_millis(100)));
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    mem.fail_next(Verb::Create, "b", Error::Invalid(ApiFailure::new(422, "Invalid", "data.k: bad value")));
    let plan = rec.plan(vec![], ["a", "b", "c"].into_iter().map(unwaited).collect()).unwrap();

    let t0 = Instant::now();
    let err = rec.apply(plan).await.unwrap_err();
    assert!(err.is_invalid(), "err={}", err);
    match &err {
        Error::Change { desc, .. } => assert!(desc.starts_with("configmap/b "), "desc={}", desc),
        other => panic!("expected change context, got {}", other),
    }
    // b fails after one call; a and c still finish their create and record
    assert_eq!(t0.elapsed(), Duration::from_millis(200));
    for name in ["a", "c"] {
        assert!(mem.stored(&config_map(name, json!({}))).unwrap().has_annotation("keel.dev/original"), "{}", name);
    }
    assert!(mem.stored(&config_map("b", json!({}))).is_none());
}

#[tokio::test(start_paused = true)]
async fn transport_failure_while_recording_retries_only_the_record() {
    let mem = Arc::new(MemoryGateway::new());
    let rec = reconciler(&mem, Conf::new(vec![]).unwrap(), opts());
    mem.fail_next(Verb::Update, "c", Error::Transport("connection reset by peer".into()));
    let plan = rec.plan(vec![], vec![unwaited("c")]).unwrap();

    rec.apply(plan).await.unwrap();
    assert_eq!(mem.count(Verb::Create), 1);
    assert_eq!(mem.count(Verb::Update), 2);
    assert!(mem.stored(&config_map("c", json!({}))).unwrap().has_annotation("keel.dev/original"));
}
