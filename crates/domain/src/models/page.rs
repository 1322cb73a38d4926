use serde::{Deserialize, Serialize};

/// 分页查询结果
///
/// `number` 为 1 起始的页号，`size` 为当前页实际条数。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: usize,
    pub size: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

impl<T> Page<T> {
    /// 对已排序的完整结果集做内存分页
    pub fn paginate(all: Vec<T>, page: usize, size: usize) -> Self {
        let page = page.max(1);
        let total_items = all.len();
        let total_pages = if size == 0 {
            0
        } else {
            total_items.div_ceil(size)
        };
        let offset = (page - 1).saturating_mul(size);
        let items: Vec<T> = all
            .into_iter()
            .skip(offset)
            .take(size)
            .collect();
        Self {
            number: page,
            size: items.len(),
            items,
            total_pages,
            total_items,
        }
    }
}
