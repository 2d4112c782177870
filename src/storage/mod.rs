mod feeds;
mod folders;
mod items;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    DatabaseError, FeedFormat, FeedItem, FeedSource, Folder, MembershipChange, MergeResult, NormalizedFeed,
    NormalizedItem,
};
