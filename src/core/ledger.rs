//! 结果台账（超出内存上限时溢出到磁盘）
//!
//! 内存中最多保留 `capacity` 行；满了之后最旧的一行追加到磁盘日志
//! （每行一个 JSON 对象）再接纳新行。已溢出的行视为最终结果，不再修改。

use crate::error::{CoreError, CoreResult};
use crate::models::{ResultKey, ResultRow};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 默认内存上限
pub const DEFAULT_MEMORY_CAP: usize = 5000;

pub struct ResultsLedger {
    capacity: usize,
    log_path: PathBuf,
    window: VecDeque<ResultRow>,
    writer: Option<BufWriter<File>>,
    spilled: usize,
}

impl ResultsLedger {
    pub fn new(log_path: PathBuf) -> Self {
        Self::with_capacity(log_path, DEFAULT_MEMORY_CAP)
    }

    pub fn with_capacity(log_path: PathBuf, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            log_path,
            window: VecDeque::with_capacity(capacity.min(1024)),
            writer: None,
            spilled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// 内存中的行数
    pub fn in_memory(&self) -> usize {
        self.window.len()
    }

    /// 已溢出到磁盘的行数
    pub fn spilled(&self) -> usize {
        self.spilled
    }

    pub fn len(&self) -> usize {
        self.spilled + self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 追加一行；内存已满时先把最旧的一行写入磁盘
    pub fn add(&mut self, row: ResultRow) -> CoreResult<()> {
        if self.window.len() >= self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                if let Err(e) = self.spill(&oldest) {
                    // 写盘失败时放回原处，保证不丢行
                    self.window.push_front(oldest);
                    return Err(e);
                }
            }
        }
        self.window.push_back(row);
        Ok(())
    }

    fn spill(&mut self, row: &ResultRow) -> CoreResult<()> {
        if self.writer.is_none() {
            if let Some(parent) = self.log_path.parent() {
                fs::create_dir_all(parent).map_err(|e| CoreError::from_io(parent, e))?;
            }
            // 同名的旧日志来自之前中断的运行，第一次溢出时截断
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.log_path)
                .map_err(|e| CoreError::from_io(&self.log_path, e))?;
            info!("结果超出内存上限 {}，开始溢出到 {:?}", self.capacity, self.log_path);
            self.writer = Some(BufWriter::new(file));
        }

        let line = serde_json::to_string(row)?;
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", line).map_err(|e| CoreError::from_io(&self.log_path, e))?;
        }
        self.spilled += 1;
        Ok(())
    }

    /// 只在内存窗口中查找并替换；已溢出的行不可修改
    pub fn update_if_present(&mut self, key: &ResultKey, row: ResultRow) -> bool {
        match self
            .window
            .iter_mut()
            .rev()
            .find(|r| r.path == key.path && r.destination == key.destination)
        {
            Some(existing) => {
                *existing = row;
                true
            }
            None => {
                debug!("结果不在内存窗口中，忽略更新: {}", key.path);
                false
            }
        }
    }

    /// 按插入顺序返回全部结果：磁盘日志在前，内存窗口在后
    pub fn all_results(&mut self) -> CoreResult<Vec<ResultRow>> {
        let mut rows = Vec::with_capacity(self.len());

        if self.spilled > 0 {
            if let Some(writer) = self.writer.as_mut() {
                writer
                    .flush()
                    .map_err(|e| CoreError::from_io(&self.log_path, e))?;
            }

            let file = File::open(&self.log_path).map_err(|e| CoreError::from_io(&self.log_path, e))?;
            for (index, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| CoreError::from_io(&self.log_path, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ResultRow>(&line) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        warn!("溢出日志第 {} 行无法解析: {}", index + 1, e);
                        return Err(e.into());
                    }
                }
            }
        }

        rows.extend(self.window.iter().cloned());
        Ok(rows)
    }

    /// 清空内存并删除磁盘日志
    pub fn clear(&mut self) -> CoreResult<()> {
        self.window.clear();
        self.writer = None;
        self.spilled = 0;

        match fs::remove_file(&self.log_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::from_io(&self.log_path, e)),
        }
    }
}
