//! 依赖图构建和拓扑排序
//!
//! 分析 Pass 之间的资源依赖关系，构建 DAG 并进行拓扑排序。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use ember_render_interface::handles::ResourceHandle;

use crate::pass::RgAccess;

/// 依赖图
pub struct DependencyGraph {
    pass_count: usize,
    /// 邻接表（出边）：pass_index -> [target_pass]
    adjacency: Vec<Vec<usize>>,
    in_degrees: Vec<usize>,
}

impl DependencyGraph {
    pub fn new(pass_count: usize) -> Self {
        Self {
            pass_count,
            adjacency: vec![Vec::new(); pass_count],
            in_degrees: vec![0; pass_count],
        }
    }

    /// 添加依赖边：`producer` 先于 `consumer` 执行
    pub fn add_edge(&mut self, producer: usize, consumer: usize) {
        if producer == consumer || self.adjacency[producer].contains(&consumer) {
            return;
        }
        self.adjacency[producer].push(consumer);
        self.in_degrees[consumer] += 1;
    }

    /// 拓扑排序，入度同时为 0 的 Pass 按声明顺序执行
    ///
    /// # 返回
    /// - `Ok(order)`: 拓扑排序后的 Pass 索引列表
    /// - `Err(cycle)`: 检测到循环依赖，返回位于环上的 Pass 索引
    pub fn topological_sort(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degrees = self.in_degrees.clone();
        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..self.pass_count).filter(|&i| in_degrees[i] == 0).map(Reverse).collect();
        let mut result = Vec::with_capacity(self.pass_count);

        while let Some(Reverse(node)) = ready.pop() {
            result.push(node);
            for &neighbor in &self.adjacency[node] {
                in_degrees[neighbor] -= 1;
                if in_degrees[neighbor] == 0 {
                    ready.push(Reverse(neighbor));
                }
            }
        }

        if result.len() != self.pass_count {
            Err(self.cycle_members((0..self.pass_count).filter(|&i| in_degrees[i] > 0).collect()))
        } else {
            Ok(result)
        }
    }

    /// 无法排序的 Pass 中，只是被环阻塞的下游 Pass 不算环的成员
    ///
    /// 反复剔除在剩余集合中没有前驱或没有后继的 Pass，直到不动点。
    fn cycle_members(&self, blocked: Vec<usize>) -> Vec<usize> {
        let mut members = blocked;
        loop {
            let kept: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| {
                    self.successors(i).iter().any(|s| members.contains(s))
                        && self.predecessors(i).iter().any(|p| members.contains(p))
                })
                .collect();
            if kept.len() == members.len() {
                return kept;
            }
            members = kept;
        }
    }

    /// Pass 的直接前驱
    pub fn predecessors(&self, pass_index: usize) -> Vec<usize> {
        self.adjacency
            .iter()
            .enumerate()
            .filter(|(_, adj)| adj.contains(&pass_index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Pass 的直接后继
    pub fn successors(&self, pass_index: usize) -> &[usize] {
        &self.adjacency[pass_index]
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum()
    }
}

/// 依赖分析器
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    /// 分析资源依赖，构建依赖图
    ///
    /// 规则与 Pass 的声明顺序无关（数据流语义）：
    /// - 同一资源的写入者（write / read-write）按声明顺序串成链
    /// - 纯读取者依赖最后一个写入者，读到的是本帧的最终内容
    /// - read-write 依赖它之前的写入者
    pub fn analyze(uses: &[Vec<(ResourceHandle, RgAccess)>]) -> DependencyGraph {
        let mut graph = DependencyGraph::new(uses.len());

        // 每个资源的写入者，按声明顺序
        let mut writers: HashMap<ResourceHandle, Vec<usize>> = HashMap::new();
        for (pass_idx, pass_uses) in uses.iter().enumerate() {
            for &(handle, access) in pass_uses {
                if access.is_write() {
                    writers.entry(handle).or_default().push(pass_idx);
                }
            }
        }

        for chain in writers.values() {
            for pair in chain.windows(2) {
                graph.add_edge(pair[0], pair[1]);
            }
        }

        for (pass_idx, pass_uses) in uses.iter().enumerate() {
            for &(handle, access) in pass_uses {
                if access != RgAccess::Read {
                    continue;
                }
                if let Some(&last_writer) = writers.get(&handle).and_then(|chain| chain.last()) {
                    graph.add_edge(last_writer, pass_idx);
                }
            }
        }

        graph
    }
}
