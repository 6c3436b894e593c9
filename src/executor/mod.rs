//! Cooperative tasks driving the balloon.
//!
//! The embedding kernel spawns [`balloon::balloon_run`] on its async
//! executor. The task is woken whenever work is queued and is expected to be
//! polled periodically as well, so deferred work is picked up once its
//! back-off expired.

pub mod balloon;
