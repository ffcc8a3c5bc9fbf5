use std::sync::Arc;
use std::time::{Duration, Instant};

use blink_host::{
    GatewayError, IpcBridge, IpcError, NativeGateway, QuickJsRealm, Scheduler, SchedulerOptions,
    Word, Words,
};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

const VIEW: usize = 0x51;

struct NullGateway;

impl NativeGateway for NullGateway {
    fn invoke(&self, _name: &str, _args: &[Word]) -> Result<Words, GatewayError> {
        Ok((0, 0))
    }
}

struct Page {
    rt: Runtime,
    scheduler: Scheduler,
    realm: Arc<QuickJsRealm>,
    bridge: IpcBridge,
}

impl Page {
    fn open(timeout: Duration) -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let scheduler = Scheduler::new(Arc::new(NullGateway), SchedulerOptions::default());
        scheduler.spawn().unwrap();

        let realm = QuickJsRealm::new(scheduler.clone()).unwrap();
        let bridge = IpcBridge::new(realm.clone(), rt.handle().clone(), timeout).unwrap();
        realm.attach(&bridge);
        realm.open_view(VIEW).unwrap();

        Self {
            rt,
            scheduler,
            realm,
            bridge,
        }
    }

    fn eval(&self, source: &str) {
        self.realm.eval(VIEW, source).unwrap();
    }

    /// Poll a page global until the page's promise chain has settled it.
    fn wait_for_global(&self, name: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let text: String = self
                .realm
                .evaluate(VIEW, &format!("JSON.stringify(globalThis.{name} ?? null)"))
                .unwrap();
            let value: Value = serde_json::from_str(&text).unwrap();
            if !value.is_null() {
                return value;
            }
            assert!(Instant::now() < deadline, "page never set {name}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.scheduler.join();
    }
}

#[test]
fn host_invokes_page_registered_channel() {
    let page = Page::open(Duration::from_secs(5));
    page.eval("ipc.handle('ping', (n) => n)");
    assert!(page.bridge.has_channel("ping"));

    let reply = page
        .rt
        .block_on(page.bridge.invoke("ping", vec![json!(42)]))
        .unwrap();
    assert_eq!(reply, json!(42));
    assert_eq!(page.bridge.pending_count(), 0);
}

#[test]
fn page_invokes_host_handler() {
    let page = Page::open(Duration::from_secs(5));
    page.bridge.handle("add", |a: i64, b: i64| a + b);

    page.eval("ipc.invoke('add', 2, '3').then((sum) => { globalThis.sum = sum; })");
    assert_eq!(page.wait_for_global("sum"), json!(5));
}

#[test]
fn unknown_host_channel_rejects_in_page() {
    let page = Page::open(Duration::from_secs(5));
    page.eval(
        "ipc.invoke('missing').then(() => { globalThis.outcome = 'resolved'; }, \
         (err) => { globalThis.outcome = err.message; })",
    );
    let outcome = page.wait_for_global("outcome");
    assert!(
        outcome.as_str().unwrap().contains("missing"),
        "unexpected outcome {outcome}"
    );
}

#[test]
fn page_handler_errors_reach_the_host() {
    let page = Page::open(Duration::from_secs(5));
    page.eval("ipc.handle('fail', () => { throw new Error('bad input'); })");

    let err = page
        .rt
        .block_on(page.bridge.invoke("fail", vec![]))
        .unwrap_err();
    match err {
        IpcError::Remote(message) => assert!(message.contains("bad input"), "{message}"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[test]
fn call_js_func_reaches_page_globals() {
    let page = Page::open(Duration::from_secs(5));
    page.eval("function greet(name) { return 'hi ' + name; }");

    let reply = page
        .rt
        .block_on(page.bridge.call_js_func(VIEW, "greet", vec![json!("ada")]))
        .unwrap();
    assert_eq!(reply, json!("hi ada"));

    let err = page
        .rt
        .block_on(page.bridge.call_js_func(VIEW, "nothing", vec![]))
        .unwrap_err();
    assert!(err.to_string().contains("nothing"), "{err}");
}

#[test]
fn silent_page_handler_times_out_and_cleans_up() {
    let page = Page::open(Duration::from_secs(5));
    page.eval("ipc.handle('slow', () => new Promise(() => {}))");

    let started = Instant::now();
    let err = page
        .rt
        .block_on(
            page.bridge
                .invoke_with_timeout("slow", vec![], Duration::from_millis(100)),
        )
        .unwrap_err();
    assert!(matches!(err, IpcError::Timeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(page.bridge.pending_count(), 0);
}

#[test]
fn closing_a_view_drops_its_channels() {
    let page = Page::open(Duration::from_secs(5));
    page.eval("ipc.handle('ping', (n) => n)");
    assert!(page.bridge.has_channel("ping"));

    assert!(page.realm.close_view(VIEW).unwrap());
    assert!(!page.bridge.has_channel("ping"));
    assert!(page.realm.views().is_empty());
}
