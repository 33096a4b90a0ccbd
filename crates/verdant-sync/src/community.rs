//! Community feed cache: posts, comments and presence.

use dashmap::DashSet;
use tracing::trace;

use crate::cache::{CacheEntry, DomainCache, MergeOutcome, OptimisticToken};
use crate::event::{Event, EventBody};
use crate::types::{Comment, CommentPatch, CommunityPost, LikeChange, PostPatch, Timestamp};

impl CacheEntry for CommunityPost {
    type Patch = PostPatch;
    const KIND: &'static str = "community-post";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply_patch(&mut self, patch: &PostPatch) {
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(image_url) = &patch.image_url {
            self.image_url = Some(image_url.clone());
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
    }
}

impl CacheEntry for Comment {
    type Patch = CommentPatch;
    const KIND: &'static str = "comment";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply_patch(&mut self, patch: &CommentPatch) {
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
    }
}

/// Cache of the community feed as seen by one user.
///
/// `liked_by_me` on posts is tracked relative to `self_user`: like events
/// from other users only move the count.
pub struct CommunityCache {
    self_user: String,
    posts: DomainCache<CommunityPost>,
    comments: DomainCache<Comment>,
    online: DashSet<String>,
}

impl CommunityCache {
    pub fn new(self_user: impl Into<String>) -> Self {
        Self::with_capacity(self_user, crate::cache::DEFAULT_CHANGE_CAPACITY)
    }

    pub fn with_capacity(self_user: impl Into<String>, capacity: usize) -> Self {
        Self {
            self_user: self_user.into(),
            posts: DomainCache::with_capacity(capacity),
            comments: DomainCache::with_capacity(capacity),
            online: DashSet::new(),
        }
    }

    /// The user whose likes set `liked_by_me`.
    pub fn self_user(&self) -> &str {
        &self.self_user
    }

    pub fn posts(&self) -> &DomainCache<CommunityPost> {
        &self.posts
    }

    pub fn comments(&self) -> &DomainCache<Comment> {
        &self.comments
    }

    /// Merge a pushed event. Returns `None` for events this cache ignores.
    pub fn apply_event(&self, event: &Event) -> Option<MergeOutcome> {
        let ts = event.timestamp;
        let outcome = match &event.body {
            EventBody::PostCreated(post) => self.apply_post_event(post.clone(), ts),
            EventBody::PostLiked(change) => self.apply_like(change, true, ts),
            EventBody::PostUnliked(change) => self.apply_like(change, false, ts),
            EventBody::CommentAdded(comment) => self.add_comment(comment.clone(), ts),
            EventBody::UserOnline { user_id } => self.set_online(user_id, true),
            EventBody::UserOffline { user_id } => self.set_online(user_id, false),
            _ => return None,
        };
        Some(outcome)
    }

    /// Merge a broadcast post, keeping the local `liked_by_me` when the post
    /// is already cached. Broadcast posts do not know who is reading.
    pub fn apply_post_event(&self, mut post: CommunityPost, ts: Timestamp) -> MergeOutcome {
        if let Some(existing) = self.posts.get(&post.id) {
            post.liked_by_me = existing.liked_by_me;
        }
        self.posts.apply_create(post, ts)
    }

    /// Store a post as returned by the REST API for `self_user`, including
    /// its `liked_by_me`.
    pub fn store_post(&self, post: CommunityPost, ts: Timestamp) -> MergeOutcome {
        self.posts.apply_create(post, ts)
    }

    /// Apply a like or unlike by any user.
    pub fn apply_like(&self, change: &LikeChange, liked: bool, ts: Timestamp) -> MergeOutcome {
        let mine = change.user_id == self.self_user;
        self.posts.apply_domain_specific(
            &change.post_id,
            |post| {
                post.like_count = change.like_count;
                if mine {
                    post.liked_by_me = liked;
                }
            },
            ts,
        )
    }

    /// Optimistically like (or unlike) a post as `self_user`.
    ///
    /// Returns `None` when the post is not cached or already in that state.
    pub fn like_optimistic(&self, post_id: &str, liked: bool) -> Option<OptimisticToken<CommunityPost>> {
        if self.posts.get(post_id)?.liked_by_me == liked {
            trace!(post_id, liked, "post already in requested like state");
            return None;
        }
        self.posts.apply_optimistic(post_id, move |post| toggle_like(post, liked))
    }

    /// Store a comment. A newly seen comment bumps its post's comment count.
    pub fn add_comment(&self, comment: Comment, ts: Timestamp) -> MergeOutcome {
        let post_id = comment.post_id.clone();
        let outcome = self.comments.apply_create(comment, ts);
        if outcome == MergeOutcome::Created {
            self.posts
                .apply_domain_specific(&post_id, |post| post.comment_count += 1, ts);
        }
        outcome
    }

    /// Delete a post and its comments.
    pub fn delete_post(&self, post_id: &str, ts: Timestamp) -> MergeOutcome {
        self.comments.delete_where(|c| c.post_id == post_id, ts);
        self.posts.apply_delete_at(post_id, ts)
    }

    /// Feed, newest first.
    pub fn feed(&self) -> Vec<CommunityPost> {
        let mut posts = self.posts.list();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        posts
    }

    /// Comments of a post, oldest first.
    pub fn comments_for(&self, post_id: &str) -> Vec<Comment> {
        let mut comments = self.comments.list_where(|c| c.post_id == post_id);
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        comments
    }

    /// Presence is not timestamp-gated: the latest online/offline wins.
    fn set_online(&self, user_id: &str, online: bool) -> MergeOutcome {
        match (online, self.online.contains(user_id)) {
            (true, false) => {
                self.online.insert(user_id.to_string());
                MergeOutcome::Created
            }
            (false, true) => {
                self.online.remove(user_id);
                MergeOutcome::Deleted
            }
            (true, true) => MergeOutcome::Stale,
            (false, false) => MergeOutcome::Absent,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Users currently online, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.online.iter().map(|u| u.key().clone()).collect();
        users.sort();
        users
    }

    /// Drop every post, comment and presence entry.
    pub fn clear(&self) {
        self.posts.clear();
        self.comments.clear();
        self.online.clear();
    }
}

pub(crate) fn toggle_like(post: &mut CommunityPost, liked: bool) {
    if liked && !post.liked_by_me {
        post.like_count += 1;
    } else if !liked && post.liked_by_me {
        post.like_count = post.like_count.saturating_sub(1);
    }
    post.liked_by_me = liked;
}
