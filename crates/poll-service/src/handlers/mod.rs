//! HTTP request handlers for the poll API.

pub mod polls;

pub use polls::{
    create_poll, delete_poll, end_poll, get_current, get_poll, issue_voting_token, list_my_polls,
    list_polls, live_updates, my_stats, vote,
};
