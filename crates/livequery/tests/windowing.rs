use futures::future::BoxFuture;
use mirrordb_core::{
    Collection, CollectionOptions, SubsetRequest, SyncAdapter, SyncHandle, SyncMetadata, SyncMode,
    SyncSession, WriteMessage,
};
use mirrordb_livequery::query::{col, from, OrderDir};
use mirrordb_livequery::{LiveQuery, LiveQueryError, LiveQueryOptions};
use mirrordb_value::{row, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// An on-demand source holding rows `1..=100`; rows only arrive through
/// `load_subset` requests.
struct PagedAdapter {
    rows: Vec<Value>,
    session: Mutex<Option<SyncSession>>,
    requests: Mutex<Vec<SubsetRequest>>,
}

impl PagedAdapter {
    fn new(count: i64) -> Arc<Self> {
        Arc::new(PagedAdapter {
            rows: (1..=count).map(|n| row! { "id" => n, "n" => n }).collect(),
            session: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<SubsetRequest> {
        self.requests.lock().clone()
    }
}

struct PagedHandle {
    adapter: Arc<PagedAdapter>,
}

impl SyncHandle for PagedHandle {
    fn load_subset(&self, request: &SubsetRequest) -> Option<BoxFuture<'static, Result<(), mirrordb_core::Error>>> {
        self.adapter.requests.lock().push(request.clone());
        let session = self.adapter.session.lock().clone()?;
        let min = request
            .min_values
            .as_ref()
            .and_then(|values| values.first())
            .and_then(Value::as_int);
        let limit = request.limit.unwrap_or(usize::MAX);
        let page: Vec<Value> = self
            .adapter
            .rows
            .iter()
            .filter(|r| match min {
                Some(min) => r.get("n").and_then(Value::as_int).is_some_and(|n| n > min),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect();
        Some(Box::pin(async move {
            session.begin();
            for value in page {
                session.write(WriteMessage::insert(value))?;
            }
            session.commit()?;
            Ok(())
        }))
    }

    fn metadata(&self) -> SyncMetadata {
        SyncMetadata {
            sync_mode: SyncMode::OnDemand,
        }
    }
}

struct PagedSource(Arc<PagedAdapter>);

impl SyncAdapter for PagedSource {
    fn start(&self, session: SyncSession) -> Result<Box<dyn SyncHandle>, mirrordb_core::Error> {
        *self.0.session.lock() = Some(session.clone());
        session.mark_ready();
        Ok(Box::new(PagedHandle {
            adapter: self.0.clone(),
        }))
    }
}

fn paged_collection(adapter: Arc<PagedAdapter>) -> Collection {
    Collection::new(
        CollectionOptions::new("numbers", "id")
            .sync(Arc::new(PagedSource(adapter)))
            .start_sync(true),
    )
}

async fn settle(lq: &LiveQuery, expected: usize) {
    for _ in 0..200 {
        if lq.results().len() == expected && !lq.collection().is_loading_subset() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "live query did not settle at {expected} rows (got {})",
        lq.results().len()
    );
}

fn ns(lq: &LiveQuery) -> Vec<i64> {
    lq.results()
        .iter()
        .map(|r| r.get("n").unwrap().as_int().unwrap())
        .collect()
}

#[tokio::test]
async fn ordered_window_loads_lazily_and_widens() {
    // Scenario: rows 1..100, `order_by n asc limit 10`; widening the window
    // to 20 issues a cursor-based load for the missing rows.
    let adapter = PagedAdapter::new(100);
    let numbers = paged_collection(adapter.clone());
    let lq = LiveQuery::new(
        from("x", numbers.clone())
            .order_by(col("x.n"), OrderDir::Asc)
            .limit(10)
            .build(),
        LiveQueryOptions::default(),
    )
    .unwrap();

    settle(&lq, 10).await;
    assert_eq!(ns(&lq), (1..=10).collect::<Vec<_>>());
    {
        let requests = adapter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].limit, Some(10));
        assert!(requests[0].min_values.is_none());
        assert!(requests[0].order_by.is_some());
    }

    lq.set_window(0, Some(20)).unwrap();
    settle(&lq, 20).await;
    assert_eq!(ns(&lq), (1..=20).collect::<Vec<_>>());

    let requests = adapter.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].limit, Some(10), "only the shortfall is requested");
    assert_eq!(requests[1].min_values, Some(vec![Value::Int(10)]));
}

#[tokio::test]
async fn identical_load_requests_are_deduplicated() {
    let adapter = PagedAdapter::new(5);
    let numbers = paged_collection(adapter.clone());
    let lq = LiveQuery::new(
        from("x", numbers.clone())
            .order_by(col("x.n"), OrderDir::Asc)
            .limit(10)
            .build(),
        LiveQueryOptions::default(),
    )
    .unwrap();

    // Only 5 rows exist; the window stays underfull but the runtime must
    // not spin on the same cursor.
    settle(&lq, 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = adapter.requests();
    // One eager request, then one cursor request discovering no new rows.
    assert!(requests.len() <= 2, "requests: {requests:?}");
}

#[tokio::test]
async fn set_window_on_unordered_query_errors() {
    let numbers = Collection::new(mirrordb_core::local_collection_options("numbers", "id"));
    let lq = LiveQuery::new(from("x", numbers).build(), LiveQueryOptions::default()).unwrap();
    assert!(matches!(
        lq.set_window(0, Some(10)),
        Err(LiveQueryError::SetWindowOnUnordered)
    ));
}

#[tokio::test]
async fn window_offset_moves_over_cached_state() {
    let adapter = PagedAdapter::new(100);
    let numbers = paged_collection(adapter.clone());
    let lq = LiveQuery::new(
        from("x", numbers.clone())
            .order_by(col("x.n"), OrderDir::Asc)
            .limit(10)
            .build(),
        LiveQueryOptions::default(),
    )
    .unwrap();
    settle(&lq, 10).await;

    // Shrinking stays within cached rows: no new load needed.
    lq.set_window(2, Some(5)).unwrap();
    settle(&lq, 5).await;
    assert_eq!(ns(&lq), (3..=7).collect::<Vec<_>>());
    assert_eq!(adapter.requests().len(), 1);
}
