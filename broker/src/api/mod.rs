pub mod etcdstore;
