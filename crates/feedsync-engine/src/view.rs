//! Binding of UI surfaces to the cache.
//!
//! A view never keeps its own copy of an entity: it holds ids (from a feed
//! loader or a detail page) and renders whatever the cache says for them.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{EntityCache, Subscription};
use crate::entity::Entity;
use crate::feed::PaginatedFeedLoader;

type Render = Arc<dyn Fn(&Entity) + Send + Sync>;

/// Subscriptions owned by one UI surface; dropped together with it.
pub struct ViewBinder {
    cache: Arc<EntityCache>,
    subscriptions: Mutex<Vec<Subscription>>,
    bound: Mutex<HashSet<String>>,
}

impl ViewBinder {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self {
            cache,
            subscriptions: Mutex::new(Vec::new()),
            bound: Mutex::new(HashSet::new()),
        }
    }

    /// Render `id` now (if cached) and again on every change.
    ///
    /// Binding an id twice is a no-op.
    pub fn bind_entity(&self, id: &str, render: impl Fn(&Entity) + Send + Sync + 'static) {
        self.bind_with(id, Arc::new(render));
    }

    /// Bind every id of the feed not bound yet. Call after each page load.
    ///
    /// Returns the number of newly bound ids.
    pub fn bind_feed(
        &self,
        feed: &PaginatedFeedLoader,
        render: impl Fn(&Entity) + Send + Sync + 'static,
    ) -> usize {
        let render: Render = Arc::new(render);
        feed.ids()
            .iter()
            .filter(|id| self.bind_with(id, Arc::clone(&render)))
            .count()
    }

    fn bind_with(&self, id: &str, render: Render) -> bool {
        if !self.bound.lock().insert(id.to_string()) {
            return false;
        }
        let callback = Arc::clone(&render);
        let subscription = self.cache.subscribe(id, move |entity| callback(entity));
        self.subscriptions.lock().push(subscription);

        if let Some(entity) = self.cache.get(id) {
            render(&entity);
        }
        true
    }

    /// Current projection of a feed: its ids resolved through the cache.
    /// Evicted entities are skipped.
    pub fn project(&self, feed: &PaginatedFeedLoader) -> Vec<Entity> {
        feed.ids()
            .iter()
            .filter_map(|id| self.cache.get(id))
            .collect()
    }

    /// Number of ids this view is bound to.
    pub fn bound_count(&self) -> usize {
        self.bound.lock().len()
    }

    /// Remove every subscription.
    pub fn unbind_all(&self) {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            self.cache.unsubscribe(subscription);
        }
        self.bound.lock().clear();
    }
}

impl Drop for ViewBinder {
    fn drop(&mut self) {
        self.unbind_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityPatch, PostPatch};
    use crate::feed::FeedKind;
    use crate::testing::{FakeBackend, post_dto, post_page};
    use pretty_assertions::assert_eq;

    fn likes_of(entity: &Entity) -> u64 {
        entity.as_post().map(|p| p.likes).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_bind_feed_renders_and_follows_updates() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(Ok(post_page(vec![post_dto("p1", 1), post_dto("p2", 2)], 1, 1)));
        let cache = EntityCache::new();
        let feed = PaginatedFeedLoader::new(FeedKind::Global, backend, Arc::clone(&cache), 10);
        feed.load_next().await.unwrap();

        let view = ViewBinder::new(Arc::clone(&cache));
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rendered);
        let bound = view.bind_feed(&feed, move |e| {
            sink.lock().push((e.id().to_string(), likes_of(e)))
        });
        assert_eq!(bound, 2);
        assert_eq!(view.bind_feed(&feed, |_| {}), 0);

        cache
            .upsert(
                "p2",
                EntityPatch::Post(PostPatch {
                    likes: Some(3),
                    ..Default::default()
                }),
            )
            .unwrap();

        assert_eq!(
            *rendered.lock(),
            vec![
                ("p1".to_string(), 1),
                ("p2".to_string(), 2),
                ("p2".to_string(), 3)
            ]
        );

        cache.evict("p1");
        let projected: Vec<u64> = view.project(&feed).iter().map(likes_of).collect();
        assert_eq!(projected, vec![3]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let cache = EntityCache::new();
        {
            let view = ViewBinder::new(Arc::clone(&cache));
            view.bind_entity("p1", |_| {});
            assert_eq!(cache.subscriber_count("p1"), 1);
            assert_eq!(view.bound_count(), 1);
        }
        assert_eq!(cache.subscriber_count("p1"), 0);
    }
}
