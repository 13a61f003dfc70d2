use std::collections::HashMap;
use std::sync::Arc;

use self_sample::SymbolTable;

use crate::telemetry::events::METHOD_NAME_MAP;
use crate::telemetry::format::Value;
use crate::telemetry::session::{RecordBatch, Session};

/// Name shared by every address the symbol table cannot resolve.
pub const UNKNOWN_METHOD: &str = "<unknown>";

/// Address → method id translation with two cache levels.
///
/// Ids are assigned per distinct name, from 1. Addresses are cached
/// separately because the same pc recurs far more often than a new name
/// appears. Names assigned since the last [`write`](Self::write) are pending
/// until then.
pub struct MethodMap {
    symbols: Arc<SymbolTable>,
    by_address: HashMap<u64, u32>,
    by_name: HashMap<String, u32>,
    names: Vec<String>,
    /// Index into `names` of the first name not yet written.
    written: usize,
    connection: Option<u64>,
}

impl MethodMap {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        Self {
            symbols,
            by_address: HashMap::new(),
            by_name: HashMap::new(),
            names: Vec::new(),
            written: 0,
            connection: None,
        }
    }

    pub fn method_id(&mut self, address: u64) -> u32 {
        if let Some(&id) = self.by_address.get(&address) {
            return id;
        }
        let name = self
            .symbols
            .lookup(address)
            .map_or_else(|| UNKNOWN_METHOD.to_string(), |s| s.to_string());
        let id = self.intern(name);
        self.by_address.insert(address, id);
        id
    }

    fn intern(&mut self, name: String) -> u32 {
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        self.names.push(name.clone());
        let id = self.names.len() as u32;
        self.by_name.insert(name, id);
        id
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        let index = id.checked_sub(1)?;
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn pending(&self) -> &[String] {
        &self.names[self.written..]
    }

    /// Write pending names as one `.sampler.methodNameMap` value.
    ///
    /// A stream opened after the last write has not seen any name yet, so on
    /// a new connection the whole table is written again from id 1.
    pub fn write(&mut self, session: &Session) {
        session.write_batch(|batch| self.write_to(batch));
    }

    /// [`write`](Self::write) inside a caller's batch, so records written
    /// after it in the same batch can rely on the names being on the stream.
    pub fn write_to(&mut self, batch: &mut RecordBatch<'_>) {
        let connection = batch.connection_id();
        if connection.is_none() {
            return;
        }
        if connection != self.connection {
            self.connection = connection;
            self.written = 0;
        }
        if self.written == self.names.len() {
            return;
        }
        let list = self.pending().iter().map(|n| Value::from(n.as_str())).collect();
        batch.write_value(METHOD_NAME_MAP, Value::List(list));
        self.written = self.names.len();
    }
}
