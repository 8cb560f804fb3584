//! Comment tree reconstruction. The store hands back a flat set of comment
//! records per post; the tree exists only client-side, rebuilt wholesale
//! after every change (comment volume per post is small).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use thiserror::Error;
use uuid::Uuid;

use super::ANONYMOUS;
use crate::entities::Comment;
use crate::repositories::{CommentRepository, RepositoryError, UserRepository};

#[derive(Debug, Error)]
pub enum CommentError {
    #[error("comment text is empty")]
    EmptyText,
    #[error(transparent)]
    Remote(#[from] RepositoryError),
}

/// Flat comment records grouped by parent. Comments with no parent hang
/// under the synthetic root; children are ordered oldest first. A comment
/// whose parent is absent from the fetched set never enters traversal but
/// stays retrievable through [`CommentThread::orphans`].
pub struct CommentThread {
    children: HashMap<Option<Uuid>, Vec<Comment>>,
    collapsed: HashSet<Uuid>,
    orphans: Vec<Comment>,
}

impl CommentThread {
    pub fn build(mut comments: Vec<Comment>) -> Self {
        comments.sort_by_key(|c| c.created_at);

        let known: HashSet<Uuid> = comments.iter().map(|c| c.id).collect();

        let mut children: HashMap<Option<Uuid>, Vec<Comment>> = HashMap::new();
        let mut orphans = vec![];
        for comment in comments {
            match comment.parent_id {
                Some(parent) if !known.contains(&parent) => orphans.push(comment),
                key => children.entry(key).or_default().push(comment),
            }
        }

        // Every node with at least one reply starts collapsed.
        let collapsed = children
            .keys()
            .filter_map(|key| *key)
            .collect();

        Self {
            children,
            collapsed,
            orphans,
        }
    }

    pub fn roots(&self) -> &[Comment] {
        self.children.get(&None).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn replies(&self, id: Uuid) -> &[Comment] {
        self.children
            .get(&Some(id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool { self.roots().is_empty() }

    pub fn orphans(&self) -> &[Comment] { &self.orphans }

    pub fn is_collapsed(&self, id: Uuid) -> bool { self.collapsed.contains(&id) }

    pub fn toggle_collapsed(&mut self, id: Uuid) {
        if !self.collapsed.remove(&id) {
            self.collapsed.insert(id);
        }
    }

    /// Depth-first traversal from the root, skipping the subtrees of
    /// collapsed nodes.
    pub fn flatten(&self) -> Vec<(usize, &Comment)> {
        let mut rows = vec![];
        for root in self.roots() {
            self.descend(root, 0, &mut rows);
        }
        rows
    }

    fn descend<'a>(&'a self, node: &'a Comment, depth: usize, rows: &mut Vec<(usize, &'a Comment)>) {
        rows.push((depth, node));
        if self.is_collapsed(node.id) {
            return;
        }
        for reply in self.replies(node.id) {
            self.descend(reply, depth + 1, rows);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorCard {
    pub username: String,
    pub profile_picture: Option<String>,
}

#[derive(Debug)]
pub struct CommentRow<'a> {
    pub depth: usize,
    pub comment: &'a Comment,
    pub author: &'a AuthorCard,
}

/// The comment screen's data: the tree plus the author profiles joined in.
pub struct CommentSection {
    post_id: Uuid,
    comments: Arc<dyn CommentRepository>,
    users: Arc<dyn UserRepository>,
    thread: CommentThread,
    authors: HashMap<Uuid, AuthorCard>,
}

impl CommentSection {
    pub async fn open(
        post_id: Uuid,
        comments: Arc<dyn CommentRepository>,
        users: Arc<dyn UserRepository>,
    ) -> Result<Self, RepositoryError> {
        let mut section = Self {
            post_id,
            comments,
            users,
            thread: CommentThread::build(vec![]),
            authors: HashMap::new(),
        };
        section.reload().await?;

        Ok(section)
    }

    /// Refetches the whole flat set and rebuilds the tree. Collapse state
    /// resets to the defaults, as on first load.
    pub async fn reload(&mut self) -> Result<(), RepositoryError> {
        let fetched = self.comments.find_by_post(self.post_id).await?;

        let author_ids: HashSet<Uuid> = fetched.iter().map(|c| c.author_id).collect();
        let cards = try_join_all(author_ids.into_iter().map(|id| {
            let users = self.users.clone();
            async move {
                match users.find(id).await {
                    Ok(u) => Ok((
                        id,
                        AuthorCard {
                            username: u.username,
                            profile_picture: u.profile_picture,
                        },
                    )),
                    // A deleted author degrades to a placeholder, not an
                    // error.
                    Err(RepositoryError::NotFound) => Ok((
                        id,
                        AuthorCard {
                            username: ANONYMOUS.into(),
                            profile_picture: None,
                        },
                    )),
                    Err(e) => Err(e),
                }
            }
        }))
        .await?;

        self.authors = cards.into_iter().collect();
        self.thread = CommentThread::build(fetched);

        Ok(())
    }

    pub async fn add_comment(
        &mut self,
        author_id: Uuid,
        text: &str,
        parent_id: Option<Uuid>,
    ) -> Result<(), CommentError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(CommentError::EmptyText);
        }

        self.comments
            .insert(Comment {
                id: Uuid::new_v4(),
                post_id: self.post_id,
                author_id,
                text: trimmed.to_owned(),
                created_at: Utc::now(),
                parent_id,
            })
            .await?;

        self.reload().await?;
        Ok(())
    }

    pub fn thread(&self) -> &CommentThread { &self.thread }

    pub fn thread_mut(&mut self) -> &mut CommentThread { &mut self.thread }

    pub fn rows(&self) -> Vec<CommentRow<'_>> {
        self.thread
            .flatten()
            .into_iter()
            .map(|(depth, comment)| CommentRow {
                depth,
                comment,
                author: self
                    .authors
                    .get(&comment.author_id)
                    .expect("author joined at reload"),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use smallvec::smallvec;

    use super::*;
    use crate::entities::{Post, User};
    use crate::repositories::mock::InMemoryBackend;
    use crate::repositories::{PostRepository, UserRepository};

    fn comment(id: Uuid, post_id: Uuid, parent_id: Option<Uuid>, at_offset: i64) -> Comment {
        Comment {
            id,
            post_id,
            author_id: Uuid::new_v4(),
            text: "hi".into(),
            created_at: Utc::now() + Duration::seconds(at_offset),
            parent_id,
        }
    }

    #[test]
    fn groups_roots_and_replies() {
        let post_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();

        let thread = CommentThread::build(vec![
            comment(c1, post_id, None, 0),
            comment(c2, post_id, Some(c1), 1),
            comment(c3, post_id, None, 2),
        ]);

        let root_ids: Vec<_> = thread.roots().iter().map(|c| c.id).collect();
        assert_eq!(root_ids, vec![c1, c3]);
        let reply_ids: Vec<_> = thread.replies(c1).iter().map(|c| c.id).collect();
        assert_eq!(reply_ids, vec![c2]);
        assert!(thread.replies(c3).is_empty());
    }

    #[test]
    fn parents_with_replies_start_collapsed() {
        let post_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();

        let mut thread = CommentThread::build(vec![
            comment(c1, post_id, None, 0),
            comment(c2, post_id, Some(c1), 1),
            comment(c3, post_id, None, 2),
        ]);

        assert!(thread.is_collapsed(c1));
        assert!(!thread.is_collapsed(c3));

        // Collapsed subtree is hidden from traversal.
        let visible: Vec<_> = thread.flatten().iter().map(|(_, c)| c.id).collect();
        assert_eq!(visible, vec![c1, c3]);

        thread.toggle_collapsed(c1);
        let visible: Vec<_> = thread.flatten().iter().map(|(_, c)| c.id).collect();
        assert_eq!(visible, vec![c1, c2, c3]);
    }

    #[test]
    fn traversal_parent_matches_parent_id() {
        let post_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();
        let c4 = Uuid::new_v4();

        let mut thread = CommentThread::build(vec![
            comment(c1, post_id, None, 0),
            comment(c2, post_id, Some(c1), 1),
            comment(c3, post_id, None, 2),
            comment(c4, post_id, Some(c2), 3),
        ]);
        thread.toggle_collapsed(c1);
        thread.toggle_collapsed(c2);

        // Walk the flattened rows with a depth stack; each node's
        // parent_id must equal the id of its traversal parent.
        let mut stack: Vec<Uuid> = vec![];
        for (depth, comment) in thread.flatten() {
            stack.truncate(depth);
            assert_eq!(comment.parent_id, stack.last().copied());
            stack.push(comment.id);
        }
    }

    #[test]
    fn orphaned_comment_is_dropped_from_traversal_but_kept() {
        let post_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let missing_parent = Uuid::new_v4();
        let orphan = Uuid::new_v4();

        let thread = CommentThread::build(vec![
            comment(c1, post_id, None, 0),
            comment(orphan, post_id, Some(missing_parent), 1),
        ]);

        let visible: Vec<_> = thread.flatten().iter().map(|(_, c)| c.id).collect();
        assert_eq!(visible, vec![c1]);
        assert_eq!(thread.orphans().len(), 1);
        assert_eq!(thread.orphans()[0].id, orphan);
    }

    #[tokio::test]
    async fn add_comment_persists_and_rebuilds() {
        let backend = Arc::new(InMemoryBackend::new());
        let author = User {
            id: Uuid::new_v4(),
            username: "ada".into(),
            full_name: "Ada".into(),
            email: "ada@example.com".into(),
            profile_picture: None,
            bio: String::new(),
            followers_count: 0,
            following_count: 0,
            is_private: false,
        };
        UserRepository::insert(&*backend, author.clone()).await.unwrap();

        let now = Utc::now();
        let p = Post {
            id: Uuid::new_v4(),
            author_id: author.id,
            content: "post".into(),
            media_urls: smallvec![],
            likes_count: 0,
            comments_count: 0,
            created_at: now,
            updated_at: now,
        };
        PostRepository::insert(&*backend, p.clone()).await.unwrap();

        let mut section = CommentSection::open(p.id, backend.clone(), backend.clone())
            .await
            .unwrap();
        assert!(section.thread().is_empty());

        section
            .add_comment(author.id, "  first!  ", None)
            .await
            .unwrap();

        let rows = section.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].comment.text, "first!");
        assert_eq!(rows[0].author.username, "ada");

        // The counter bump rode in the same batch as the comment.
        assert_eq!(
            PostRepository::find(&*backend, p.id).await.unwrap().comments_count,
            1
        );
    }

    #[tokio::test]
    async fn empty_comment_never_reaches_the_store() {
        let backend = Arc::new(InMemoryBackend::new());
        let author_id = Uuid::new_v4();

        let now = Utc::now();
        let p = Post {
            id: Uuid::new_v4(),
            author_id,
            content: "post".into(),
            media_urls: smallvec![],
            likes_count: 0,
            comments_count: 0,
            created_at: now,
            updated_at: now,
        };
        PostRepository::insert(&*backend, p.clone()).await.unwrap();

        let mut section = CommentSection::open(p.id, backend.clone(), backend.clone())
            .await
            .unwrap();

        let err = section.add_comment(author_id, "   ", None).await.unwrap_err();
        assert!(matches!(err, CommentError::EmptyText));
        assert!(backend.find_by_post(p.id).await.unwrap().is_empty());
    }
}
