//! A library for managing BitTorrent torrents inside a session.
//!
//! This crate is the torrent layer of a BitTorrent client: it decides when a
//! torrent starts, stops, gets verified or removed, keeps track of which
//! pieces and blocks are on disk, and produces the stats a UI shows.
//!
//! The wire protocol, trackers and peers are plugged in through the traits
//! in [`peer`] and [`tracker`], resume state through [`resume::ResumeStore`].
//!
//! Everything that changes tracker or peer state runs on the session's
//! event thread, local data is hash checked on a verify thread, and the
//! public API is synchronous.
//!
//! # Example
//!
//! ```no_run
//! use tessera::{
//!     config::ResolvedConfig,
//!     ctor::{Ctor, CtorMode},
//!     session::{Collaborators, Session},
//! };
//!
//! let config = ResolvedConfig::in_dir("/tmp/tessera".as_ref());
//! let session = Session::new(config.clone(), Collaborators::with_resume_dir(&config)).unwrap();
//!
//! let mut ctor = Ctor::from_file(&session, "debian.torrent").unwrap();
//! // don't start it yet
//! ctor.set_paused(CtorMode::Force, true);
//!
//! let torrent = session.add_torrent(&ctor).unwrap();
//! torrent.start();
//! ```

pub mod bandwidth;
pub mod bitfield;
pub mod completion;
pub mod config;
pub mod ctor;
pub mod error;
pub mod event;
pub mod fdlimit;
pub mod inout;
pub mod metainfo;
pub mod peer;
pub mod resume;
pub mod session;
pub mod torrent;
pub mod tracker;
pub mod utils;
pub mod verify;
