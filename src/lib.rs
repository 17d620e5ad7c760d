//! # docusearch
//!
//! Asynchronous document ingestion with keyword search and
//! retrieval-augmented question answering.
//!
//! Uploads are stored as blobs and flow through an event-driven pipeline:
//! an extraction stage turns them into text (OCR for scans and images), a
//! chunking & embedding stage splits the text into fixed windows, writes a
//! full-text entry and one vector per chunk, and marks the document
//! `indexed`. Questions are answered from an owner's indexed chunks only.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  DocumentUploaded  ┌────────────┐  DocumentProcessed  ┌───────────┐
//! │  Ingest  │───────────────────▶│ Extraction │────────────────────▶│ Embedding │
//! │ (upload) │                    │ (text+OCR) │                     │ (chunks)  │
//! └────┬─────┘                    └─────┬──────┘                     └─────┬─────┘
//!      │ blob                          │ text                        FTS5 │ vectors
//!      ▼                               ▼                                  ▼
//! ┌──────────┐                   ┌──────────────┐                  ┌─────────────┐
//! │ Blob     │                   │   Metadata   │◀─────────────────│ Dual index  │
//! │ fs / S3  │                   │ + status     │                  │ FTS + vec   │
//! └──────────┘                   └──────────────┘                  └──────┬──────┘
//!                                                                         │
//!                                         ┌───────────────────────────────┤
//!                                         ▼                               ▼
//!                                   ┌──────────┐                   ┌───────────┐
//!                                   │  Search  │                   │ Query/RAG │
//!                                   └──────────┘                   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy shared by stages, queries, and HTTP |
//! | [`models`] | Core data types |
//! | [`events`] | Pipeline event payloads |
//! | [`bus`] | Durable event bus with consumer groups |
//! | [`blob`] | Blob storage (filesystem, S3-compatible) |
//! | [`metadata`] | Documents, chunks, query history |
//! | [`status`] | Per-document status snapshots |
//! | [`extract`] / [`ocr`] | Text extraction |
//! | [`chunk`] | Fixed-window chunking |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Chat-completion providers |
//! | [`index`] | Full-text and vector indexes |
//! | [`ingest`] | Upload, delete, reprocess |
//! | [`stages`] | Extraction and embedding stage handlers |
//! | [`worker`] | Stage runners over the bus |
//! | [`search`] | Keyword search |
//! | [`query`] | Question answering |
//! | [`services`] | Shared service handles |
//! | [`server`] | HTTP server |
//! | [`db`] / [`migrate`] | Database connection and schema |

pub mod blob;
pub mod bus;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod query;
pub mod search;
pub mod server;
pub mod services;
pub mod stages;
pub mod status;
pub mod worker;
