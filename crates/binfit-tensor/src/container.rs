//! Chunked binary container for model tensors and fit results.
//!
//! The container is a flat key-value store of typed arrays written
//! sequentially, followed by a footer index so individual entries can be
//! re-read with a single seek. All scalars are little-endian.
//!
//! Layout:
//!
//! ```text
//! "BFTC"
//! entry*   = [u32 key_len][key][u8 tag][u8 ndim][u64 dim]*ndim
//!            [u64 payload_len][payload]
//! index    = [u64 count] ([u32 key_len][key][u64 entry_offset])*count
//! trailer  = [u64 index_offset]"BFTE"
//! ```
//!
//! Large payloads are flushed in bounded chunks so writing a multi-GB tensor
//! never needs a contiguous serialization buffer.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use binfit_core::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::axis::ChannelInfo;
use crate::sparse::SparseArray2;
use crate::tensor::{LogkStorage, ModelTensor, NormStorage, SystGroup};

const MAGIC_HEAD: &[u8; 4] = b"BFTC";
const MAGIC_TAIL: &[u8; 4] = b"BFTE";
const CHUNK_BYTES: usize = 4 * 1024 * 1024;

const TAG_F64: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_STR_LIST: u8 = 2;
const TAG_JSON: u8 = 3;

/// Sequential writer; call [`finish`](Self::finish) to emit the footer index.
pub struct ContainerWriter {
    out: BufWriter<File>,
    index: Vec<(String, u64)>,
    offset: u64,
}

impl ContainerWriter {
    /// Create (truncating) a container file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC_HEAD)?;
        Ok(Self { out, index: Vec::new(), offset: MAGIC_HEAD.len() as u64 })
    }

    fn begin_entry(&mut self, key: &str, tag: u8, dims: &[usize], payload_len: u64) -> Result<()> {
        if self.index.iter().any(|(k, _)| k == key) {
            return Err(Error::Configuration(format!("Duplicate container key '{key}'")));
        }
        if dims.len() > u8::MAX as usize {
            return Err(Error::Configuration(format!("Entry '{key}' has too many dimensions")));
        }
        self.index.push((key.to_string(), self.offset));

        let key_bytes = key.as_bytes();
        self.out.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
        self.out.write_all(key_bytes)?;
        self.out.write_all(&[tag, dims.len() as u8])?;
        for &d in dims {
            self.out.write_all(&(d as u64).to_le_bytes())?;
        }
        self.out.write_all(&payload_len.to_le_bytes())?;
        self.offset += 4 + key_bytes.len() as u64 + 2 + 8 * dims.len() as u64 + 8 + payload_len;
        Ok(())
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(CHUNK_BYTES) {
            self.out.write_all(chunk)?;
        }
        Ok(())
    }

    /// Write an n-dimensional `f64` array.
    pub fn put_f64(&mut self, key: &str, dims: &[usize], data: &[f64]) -> Result<()> {
        let expect: usize = dims.iter().product();
        if data.len() != expect {
            return Err(Error::Configuration(format!(
                "Entry '{key}': {} values do not fill shape {dims:?}",
                data.len()
            )));
        }
        self.begin_entry(key, TAG_F64, dims, (8 * data.len()) as u64)?;
        let mut buf = Vec::with_capacity(CHUNK_BYTES.min(8 * data.len()));
        for slab in data.chunks(CHUNK_BYTES / 8) {
            buf.clear();
            for &v in slab {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            self.out.write_all(&buf)?;
        }
        Ok(())
    }

    /// Write an n-dimensional `i64` array.
    pub fn put_i64(&mut self, key: &str, dims: &[usize], data: &[i64]) -> Result<()> {
        let expect: usize = dims.iter().product();
        if data.len() != expect {
            return Err(Error::Configuration(format!(
                "Entry '{key}': {} values do not fill shape {dims:?}",
                data.len()
            )));
        }
        self.begin_entry(key, TAG_I64, dims, (8 * data.len()) as u64)?;
        let mut buf = Vec::with_capacity(CHUNK_BYTES.min(8 * data.len()));
        for slab in data.chunks(CHUNK_BYTES / 8) {
            buf.clear();
            for &v in slab {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            self.out.write_all(&buf)?;
        }
        Ok(())
    }

    /// Write a list of strings (length-prefixed UTF-8).
    pub fn put_strings(&mut self, key: &str, items: &[String]) -> Result<()> {
        let mut payload = Vec::new();
        for item in items {
            payload.extend_from_slice(&(item.len() as u32).to_le_bytes());
            payload.extend_from_slice(item.as_bytes());
        }
        self.begin_entry(key, TAG_STR_LIST, &[items.len()], payload.len() as u64)?;
        self.write_payload(&payload)
    }

    /// Write any serializable value as a JSON blob.
    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.begin_entry(key, TAG_JSON, &[], payload.len() as u64)?;
        self.write_payload(&payload)
    }

    /// Write the footer index and trailer, consuming the writer.
    pub fn finish(mut self) -> Result<()> {
        let index_offset = self.offset;
        self.out.write_all(&(self.index.len() as u64).to_le_bytes())?;
        for (key, offset) in &self.index {
            self.out.write_all(&(key.len() as u32).to_le_bytes())?;
            self.out.write_all(key.as_bytes())?;
            self.out.write_all(&offset.to_le_bytes())?;
        }
        self.out.write_all(&index_offset.to_le_bytes())?;
        self.out.write_all(MAGIC_TAIL)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Random-access reader over a finished container file.
pub struct ContainerReader {
    file: BufReader<File>,
    index: BTreeMap<String, u64>,
}

impl ContainerReader {
    /// Open a container and load its footer index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut head = [0u8; 4];
        file.read_exact(&mut head)?;
        if &head != MAGIC_HEAD {
            return Err(Error::DataIntegrity("Not a model tensor container".to_string()));
        }

        file.seek(SeekFrom::End(-12))?;
        let index_offset = read_u64(&mut file)?;
        let mut tail = [0u8; 4];
        file.read_exact(&mut tail)?;
        if &tail != MAGIC_TAIL {
            return Err(Error::DataIntegrity("Container trailer is corrupt".to_string()));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let count = read_u64(&mut file)? as usize;
        let mut index = BTreeMap::new();
        for _ in 0..count {
            let key = read_string(&mut file)?;
            let offset = read_u64(&mut file)?;
            index.insert(key, offset);
        }
        Ok(Self { file, index })
    }

    /// Keys present in the container, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// True if the container holds `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    fn seek_entry(&mut self, key: &str, expected_tag: u8) -> Result<(Vec<usize>, u64)> {
        let offset = *self
            .index
            .get(key)
            .ok_or_else(|| Error::Configuration(format!("Container key '{key}' not found")))?;
        self.file.seek(SeekFrom::Start(offset))?;

        let stored_key = read_string(&mut self.file)?;
        if stored_key != key {
            return Err(Error::DataIntegrity(format!(
                "Index for '{key}' points at entry '{stored_key}'"
            )));
        }
        let mut tag_ndim = [0u8; 2];
        self.file.read_exact(&mut tag_ndim)?;
        if tag_ndim[0] != expected_tag {
            return Err(Error::DataIntegrity(format!(
                "Entry '{key}' has type tag {} but {} was requested",
                tag_ndim[0], expected_tag
            )));
        }
        let mut dims = Vec::with_capacity(tag_ndim[1] as usize);
        for _ in 0..tag_ndim[1] {
            dims.push(read_u64(&mut self.file)? as usize);
        }
        let payload_len = read_u64(&mut self.file)?;
        Ok((dims, payload_len))
    }

    /// Read an `f64` array entry as `(dims, values)`.
    pub fn get_f64(&mut self, key: &str) -> Result<(Vec<usize>, Vec<f64>)> {
        let (dims, payload_len) = self.seek_entry(key, TAG_F64)?;
        let count: usize = dims.iter().product();
        if payload_len != (8 * count) as u64 {
            return Err(Error::DataIntegrity(format!("Entry '{key}' payload size mismatch")));
        }
        let mut values = Vec::with_capacity(count);
        let mut buf = vec![0u8; CHUNK_BYTES.min(8 * count.max(1))];
        let mut remaining = 8 * count;
        while remaining > 0 {
            let take = remaining.min(buf.len());
            self.file.read_exact(&mut buf[..take])?;
            for word in buf[..take].chunks_exact(8) {
                values.push(f64::from_le_bytes(word.try_into().unwrap()));
            }
            remaining -= take;
        }
        Ok((dims, values))
    }

    /// Read an `i64` array entry as `(dims, values)`.
    pub fn get_i64(&mut self, key: &str) -> Result<(Vec<usize>, Vec<i64>)> {
        let (dims, payload_len) = self.seek_entry(key, TAG_I64)?;
        let count: usize = dims.iter().product();
        if payload_len != (8 * count) as u64 {
            return Err(Error::DataIntegrity(format!("Entry '{key}' payload size mismatch")));
        }
        let mut values = Vec::with_capacity(count);
        let mut buf = vec![0u8; CHUNK_BYTES.min(8 * count.max(1))];
        let mut remaining = 8 * count;
        while remaining > 0 {
            let take = remaining.min(buf.len());
            self.file.read_exact(&mut buf[..take])?;
            for word in buf[..take].chunks_exact(8) {
                values.push(i64::from_le_bytes(word.try_into().unwrap()));
            }
            remaining -= take;
        }
        Ok((dims, values))
    }

    /// Read a string-list entry.
    pub fn get_strings(&mut self, key: &str) -> Result<Vec<String>> {
        let (dims, _) = self.seek_entry(key, TAG_STR_LIST)?;
        let count = dims.first().copied().unwrap_or(0);
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read_string(&mut self.file)?);
        }
        Ok(items)
    }

    /// Read and deserialize a JSON blob entry.
    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<T> {
        let (_, payload_len) = self.seek_entry(key, TAG_JSON)?;
        let mut payload = vec![0u8; payload_len as usize];
        self.file.read_exact(&mut payload)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| Error::DataIntegrity("Container string is not valid UTF-8".to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelMeta {
    format_version: u32,
    nsignals: usize,
    symmetric: bool,
    sparse: bool,
    norm_shape: [usize; 2],
    logk_shape: [usize; 2],
}

/// Persist a model tensor to `path`.
pub fn write_model<P: AsRef<Path>>(path: P, tensor: &ModelTensor) -> Result<()> {
    let mut w = ContainerWriter::create(path)?;

    let (sparse, norm_shape, logk_shape) = match (&tensor.norm, &tensor.logk) {
        (NormStorage::Dense(_), LogkStorage::Dense(_)) => {
            let slices = if tensor.symmetric { 1 } else { 2 };
            (
                false,
                [tensor.nbins, tensor.nproc()],
                [tensor.nbins * tensor.nproc(), slices * tensor.nsyst()],
            )
        }
        (NormStorage::Sparse(n), LogkStorage::Sparse(k)) => (true, n.shape, k.shape),
        _ => {
            return Err(Error::Configuration(
                "Model tensor mixes dense and sparse storage".to_string(),
            ))
        }
    };
    let meta = ModelMeta {
        format_version: 1,
        nsignals: tensor.nsignals,
        symmetric: tensor.symmetric,
        sparse,
        norm_shape,
        logk_shape,
    };
    w.put_json("meta", &meta)?;
    w.put_json("channels", &tensor.channels)?;

    w.put_strings("procs", &tensor.procs)?;
    w.put_strings("systs", &tensor.systs)?;
    w.put_strings("systsnoi", &tensor.systsnoi)?;
    w.put_strings("systsnoconstraint", &tensor.systsnoconstraint)?;
    w.put_strings("systsnoprofile", &tensor.systsnoprofile)?;
    w.put_f64("constraintweights", &[tensor.constraintweights.len()], &tensor.constraintweights)?;
    write_groups(&mut w, "systgroups", &tensor.systgroups)?;
    write_groups(&mut w, "noigroups", &tensor.noigroups)?;

    w.put_f64("hkstat", &[tensor.kstat.len()], &tensor.kstat)?;
    if let Some(data) = &tensor.data_obs {
        w.put_f64("hdata_obs", &[data.len()], data)?;
    }
    w.put_strings("pseudodata_names", &tensor.pseudodata_names)?;
    w.put_f64(
        "hpseudodata",
        &[tensor.nbins, tensor.pseudodata_names.len()],
        &tensor.pseudodata,
    )?;
    if let Some(cov_inv) = &tensor.data_cov_inv {
        w.put_f64("data_cov_inv", &[tensor.nbins, tensor.nbins], cov_inv)?;
    }

    match &tensor.norm {
        NormStorage::Dense(values) => {
            w.put_f64("hnorm", &[tensor.nbins, tensor.nproc()], values)?;
        }
        NormStorage::Sparse(s) => {
            write_sparse(&mut w, "hnorm", s)?;
        }
    }
    match &tensor.logk {
        LogkStorage::Dense(values) => {
            let slices = if tensor.symmetric { 1 } else { 2 };
            w.put_f64(
                "hlogk",
                &[tensor.nbins, tensor.nproc(), slices, tensor.nsyst()],
                values,
            )?;
        }
        LogkStorage::Sparse(s) => {
            write_sparse(&mut w, "hlogk", s)?;
        }
    }

    w.finish()
}

fn write_groups(w: &mut ContainerWriter, prefix: &str, groups: &[SystGroup]) -> Result<()> {
    let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();
    let mut idxs: Vec<i64> = Vec::new();
    let mut offsets: Vec<i64> = Vec::with_capacity(groups.len() + 1);
    offsets.push(0);
    for g in groups {
        idxs.extend(g.indices.iter().map(|&i| i as i64));
        offsets.push(idxs.len() as i64);
    }
    w.put_strings(&format!("{prefix}_names"), &names)?;
    w.put_i64(&format!("{prefix}_idxs"), &[idxs.len()], &idxs)?;
    w.put_i64(&format!("{prefix}_offsets"), &[offsets.len()], &offsets)?;
    Ok(())
}

fn read_groups(r: &mut ContainerReader, prefix: &str) -> Result<Vec<SystGroup>> {
    let names = r.get_strings(&format!("{prefix}_names"))?;
    let (_, idxs) = r.get_i64(&format!("{prefix}_idxs"))?;
    let (_, offsets) = r.get_i64(&format!("{prefix}_offsets"))?;
    if offsets.len() != names.len() + 1 {
        return Err(Error::DataIntegrity(format!("Group offsets for '{prefix}' are inconsistent")));
    }
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let lo = offsets[i] as usize;
            let hi = offsets[i + 1] as usize;
            if lo > hi || hi > idxs.len() {
                return Err(Error::DataIntegrity(format!(
                    "Group offsets for '{prefix}' are out of range"
                )));
            }
            Ok(SystGroup { name, indices: idxs[lo..hi].iter().map(|&v| v as usize).collect() })
        })
        .collect()
}

fn write_sparse(w: &mut ContainerWriter, key: &str, s: &SparseArray2) -> Result<()> {
    let flat: Vec<i64> = s.indices.iter().flat_map(|ij| ij.iter().copied()).collect();
    w.put_i64(&format!("{key}_indices"), &[s.nnz(), 2], &flat)?;
    w.put_f64(&format!("{key}_values"), &[s.nnz()], &s.values)?;
    Ok(())
}

fn read_sparse(r: &mut ContainerReader, key: &str, shape: [usize; 2]) -> Result<SparseArray2> {
    let (dims, flat) = r.get_i64(&format!("{key}_indices"))?;
    if dims.len() != 2 || dims[1] != 2 {
        return Err(Error::DataIntegrity(format!("Sparse index array '{key}' has bad shape")));
    }
    let indices: Vec<[i64; 2]> = flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
    let (vdims, values) = r.get_f64(&format!("{key}_values"))?;
    if vdims != [dims[0]] || values.len() != indices.len() {
        return Err(Error::DataIntegrity(format!(
            "Sparse value array '{key}' does not match its indices"
        )));
    }
    let arr = SparseArray2 { indices, values, shape };
    if !arr.is_canonical() {
        return Err(Error::DataIntegrity(format!(
            "Sparse array '{key}' entries are not in canonical order"
        )));
    }
    Ok(arr)
}

/// Load a model tensor from `path`.
pub fn read_model<P: AsRef<Path>>(path: P) -> Result<ModelTensor> {
    let mut r = ContainerReader::open(path)?;

    let meta: ModelMeta = r.get_json("meta")?;
    if meta.format_version != 1 {
        return Err(Error::Unsupported(format!(
            "Container format version {} is not supported",
            meta.format_version
        )));
    }
    let channels: Vec<ChannelInfo> = r.get_json("channels")?;
    let nbins: usize = channels.iter().map(ChannelInfo::nbins).sum();
    if nbins != meta.norm_shape[0] {
        return Err(Error::DataIntegrity(format!(
            "Channel bins sum to {nbins} but the tensor has {} rows",
            meta.norm_shape[0]
        )));
    }

    let procs = r.get_strings("procs")?;
    let systs = r.get_strings("systs")?;
    let systsnoi = r.get_strings("systsnoi")?;
    let systsnoconstraint = r.get_strings("systsnoconstraint")?;
    let systsnoprofile = r.get_strings("systsnoprofile")?;
    let (_, constraintweights) = r.get_f64("constraintweights")?;
    let systgroups = read_groups(&mut r, "systgroups")?;
    let noigroups = read_groups(&mut r, "noigroups")?;

    let (_, kstat) = r.get_f64("hkstat")?;
    let data_obs = if r.contains("hdata_obs") { Some(r.get_f64("hdata_obs")?.1) } else { None };
    let pseudodata_names = r.get_strings("pseudodata_names")?;
    let (pd_dims, pseudodata) = r.get_f64("hpseudodata")?;
    if pd_dims != [nbins, pseudodata_names.len()] {
        return Err(Error::DataIntegrity("Pseudodata matrix has bad shape".to_string()));
    }
    let data_cov_inv =
        if r.contains("data_cov_inv") { Some(r.get_f64("data_cov_inv")?.1) } else { None };

    let (norm, logk) = if meta.sparse {
        (
            NormStorage::Sparse(read_sparse(&mut r, "hnorm", meta.norm_shape)?),
            LogkStorage::Sparse(read_sparse(&mut r, "hlogk", meta.logk_shape)?),
        )
    } else {
        let (norm_dims, norm_values) = r.get_f64("hnorm")?;
        if norm_dims != [nbins, procs.len()] {
            return Err(Error::DataIntegrity("Normalization tensor has bad shape".to_string()));
        }
        let (logk_dims, logk_values) = r.get_f64("hlogk")?;
        let slices = if meta.symmetric { 1 } else { 2 };
        if logk_dims != [nbins, procs.len(), slices, systs.len()] {
            return Err(Error::DataIntegrity("Log-effect tensor has bad shape".to_string()));
        }
        (NormStorage::Dense(norm_values), LogkStorage::Dense(logk_values))
    };

    Ok(ModelTensor {
        channels,
        nbins,
        procs,
        nsignals: meta.nsignals,
        systs,
        systsnoi,
        systsnoconstraint,
        systsnoprofile,
        constraintweights,
        systgroups,
        noigroups,
        kstat,
        data_obs,
        pseudodata_names,
        pseudodata,
        data_cov_inv,
        symmetric: meta.symmetric,
        norm,
        logk,
    })
}
