//! Inode chains
//!
//! A logical file is a head inode followed by continuation inodes linked by
//! inode number. Every link but the last holds a full set of direct
//! pointers. Links are always re-resolved through the inode table, so a
//! later link can move without rewriting the ones before it.

use alloc::{vec, vec::Vec};

use crate::{
    common::{LfsError, LfsResult},
    fs::LfsState,
    inode::Inode,
    layout::BlockAddr,
};

pub(crate) struct InodeChain {
    links: Vec<Inode>,
    dirty: Vec<bool>,
    per_link: usize,
}

impl InodeChain {
    pub fn load(st: &LfsState, head: u32) -> LfsResult<Self> {
        let mut links = vec![st.get_inode(head)?];
        while let Some(next) = links[links.len() - 1].next {
            if links.len() as u32 >= st.geo().max_inodes {
                return Err(LfsError::corrupt("inode chain loops"));
            }
            links.push(st.get_inode(next)?);
        }
        let per_link = st.geo().direct_per_inode();
        if links[..links.len() - 1].iter().any(|l| l.direct.len() != per_link) {
            return Err(LfsError::corrupt("short link inside inode chain"));
        }
        Ok(Self {
            dirty: vec![false; links.len()],
            links,
            per_link,
        })
    }

    pub fn head(&self) -> &Inode {
        &self.links[0]
    }

    pub fn head_mut(&mut self) -> &mut Inode {
        self.dirty[0] = true;
        &mut self.links[0]
    }

    pub fn inode_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.links.iter().map(|l| l.ino)
    }

    pub fn block_count(&self) -> usize {
        self.links.iter().map(|l| l.direct.len()).sum()
    }

    pub fn block_addr(&self, index: usize) -> Option<BlockAddr> {
        self.links
            .get(index / self.per_link)
            .and_then(|l| l.direct.get(index % self.per_link))
            .copied()
    }

    pub fn read_block(&self, st: &LfsState, index: usize) -> LfsResult<Vec<u8>> {
        let addr = self
            .block_addr(index)
            .ok_or_else(|| LfsError::corrupt("block index past end of chain"))?;
        st.read_block(addr)
    }

    /// Append `data` as block `index`, replacing an existing block or
    /// extending the chain by exactly one block.
    pub fn put_block(&mut self, st: &mut LfsState, index: usize, data: &[u8]) -> LfsResult<()> {
        let count = self.block_count();
        if index > count {
            return Err(LfsError::InvalidArgument);
        }
        let (link, slot) = (index / self.per_link, index % self.per_link);
        if link == self.links.len() {
            let ino = st.alloc_ino()?;
            let cont = Inode::continuation(ino, &self.links[0]);
            let last = self.links.len() - 1;
            self.links[last].next = Some(ino);
            self.dirty[last] = true;
            self.links.push(cont);
            self.dirty.push(true);
        }
        let owner = self.links[link].ino;
        let addr = st.append_data(owner, slot as u32, data)?;
        let direct = &mut self.links[link].direct;
        if slot == direct.len() {
            direct.push(addr);
        } else {
            direct[slot] = addr;
        }
        self.dirty[link] = true;
        Ok(())
    }

    /// Keep the first `count` blocks. Returns the continuation inodes that
    /// fell off the end.
    pub fn truncate_blocks(&mut self, count: usize) -> Vec<u32> {
        let keep_links = ((count + self.per_link - 1) / self.per_link).max(1);
        let mut dropped = Vec::new();
        while self.links.len() > keep_links {
            if let Some(link) = self.links.pop() {
                dropped.push(link.ino);
            }
            self.dirty.pop();
        }
        let last = self.links.len() - 1;
        let tail_count = count - last * self.per_link;
        if self.links[last].direct.len() != tail_count || self.links[last].next.is_some() {
            self.links[last].direct.truncate(tail_count);
            self.links[last].next = None;
            self.dirty[last] = true;
        }
        dropped
    }

    /// Append every modified link, last link first.
    pub fn commit(self, st: &mut LfsState) -> LfsResult<()> {
        for (link, dirty) in self.links.iter().zip(self.dirty.iter()).rev() {
            if *dirty {
                st.append_inode(link)?;
            }
        }
        Ok(())
    }
}
