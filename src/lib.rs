//! # SVO Provider
//!
//! Metadata provider for the Solar Virtual Observatory catalog.
//!
//! The provider reads observation records from FITS headers (local files or
//! remote URLs) or from TAP services, turns them into catalog resources made
//! of a metadata record and a data location, and submits them to the
//! catalog REST API without creating duplicate data locations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────┐
//! │   Sources    │──▶│    Extraction     │──▶│  Catalog  │
//! │ FITS / TAP   │   │ metadata+location │   │ REST API  │
//! └──────────────┘   └──────────────────┘   └───────────┘
//!        ▲                    ▲
//!        │                    │
//!   ┌──────────┐        ┌───────────┐
//!   │  Files   │        │ Keywords  │
//!   │ globbing │        │ + rules   │
//!   └──────────┘        └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! svo inspect fits data/*.fits --output keywords.json
//! svo datasets
//! svo submit swap 'data/**/*.fits' --dry-run
//! svo submit lars --min-modif-time 2024-01-01
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Keyword definitions, values and resources |
//! | [`convert`] | Raw value to keyword type conversion |
//! | [`fits`] | FITS header reading, local and remote |
//! | [`votable`] | VOTable decoding |
//! | [`tap`] | TAP queries and paginated record streams |
//! | [`metadata`] | Metadata field extraction |
//! | [`rules`] | Declarative per-dataset field rules |
//! | [`data_location`] | Data location extraction |
//! | [`catalog`] | Catalog abstraction, REST and in-memory |
//! | [`provider`] | Resource assembly, deduplication and submission |
//! | [`files`] | Input file globbing |
//! | [`progress`] | Batch progress reporting |
//! | [`inspect`] | Keyword definition inspection |
//! | [`datasets`] | Dataset and keyword listings |

pub mod catalog;
pub mod config;
pub mod convert;
pub mod data_location;
pub mod datasets;
pub mod files;
pub mod fits;
pub mod inspect;
pub mod metadata;
pub mod models;
pub mod progress;
pub mod provider;
pub mod rules;
pub mod tap;
pub mod votable;
